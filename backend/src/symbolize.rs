//! Bulk address symbolization in the pprof `symbol` endpoint convention.
//!
//! A client POSTs `addr+addr+...+addr` and gets one resolved line per non-zero
//! address, in input order. Any other method gets [`CAPABILITY_LINE`], which
//! tells the client symbols are available.
//!
//! The body is consumed as a stream of tokens. At most [`MAX_TOKEN_LEN`] bytes
//! are buffered for one token no matter how large the body is.

use std::{fmt::Write as _, io};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    runtime::{Handle, RuntimeFlavor},
};

use crate::allocator::SymbolSource;

/// Separator between addresses in a request body.
pub const DELIMITER: u8 = b'+';

/// Reply to anything that is not a POST.
pub const CAPABILITY_LINE: &str = "num_symbols: 1\n";

/// Longest token, delimiter included, accepted before reading fails.
pub const MAX_TOKEN_LEN: usize = 4096;

/// Reading the request body stopped early.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// A token ran past [`MAX_TOKEN_LEN`] without a delimiter.
    #[error("token exceeds {MAX_TOKEN_LEN} bytes")]
    TooLong,
    /// The underlying body stream failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Pull-based sequence of addresses read off a body, one token at a time.
///
/// Yields one item per token: the parsed address (`0` when the token is not a
/// valid address) and, at most once, the error that ended reading. Not
/// restartable; after the final item it keeps returning `None`.
pub struct AddressTokens<R> {
    reader: R,
    token: Vec<u8>,
    pending: Option<TokenError>,
    finished: bool,
}

impl<R> AddressTokens<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Starts reading tokens from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            token: Vec::new(),
            pending: None,
            finished: false,
        }
    }

    /// Next address, or the error that cut the body short.
    ///
    /// Bytes read before an error still form a token and are yielded first.
    pub async fn next_address(&mut self) -> Option<Result<u64, TokenError>> {
        if let Some(err) = self.pending.take() {
            self.finished = true;
            return Some(Err(err));
        }
        if self.finished {
            return None;
        }

        self.token.clear();
        loop {
            let room = MAX_TOKEN_LEN - self.token.len();
            let (consumed, delimited) = match self.reader.fill_buf().await {
                Ok([]) => {
                    self.finished = true;
                    return Some(Ok(parse_address(&self.token)));
                },
                Ok(buf) => {
                    let window = &buf[..buf.len().min(room)];
                    match window.iter().position(|byte| *byte == DELIMITER) {
                        Some(index) => {
                            self.token.extend_from_slice(&window[..index]);
                            (index + 1, true)
                        },
                        None => {
                            self.token.extend_from_slice(window);
                            (window.len(), false)
                        },
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.pending = Some(TokenError::Io(err));
                    return Some(Ok(parse_address(&self.token)));
                },
            };
            self.reader.consume(consumed);

            if delimited {
                return Some(Ok(parse_address(&self.token)));
            }
            if self.token.len() >= MAX_TOKEN_LEN {
                self.pending = Some(TokenError::TooLong);
                return Some(Ok(parse_address(&self.token)));
            }
        }
    }
}

/// Parses one hexadecimal address token, `0x`/`0X` prefix optional.
///
/// Anything that is not a valid `u64` maps to `0`, which callers treat as
/// "nothing to report".
pub fn parse_address(token: &[u8]) -> u64 {
    let digits = token
        .strip_prefix(b"0x")
        .or_else(|| token.strip_prefix(b"0X"))
        .unwrap_or(token);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
        return 0;
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|digits| u64::from_str_radix(digits, 16).ok())
        .unwrap_or(0)
}

/// Resolves every non-zero address in `reader` and returns the response body.
///
/// The whole response is built before anything is sent because the status
/// line and headers go out first. A read error is reported as a final
/// `reading request: ...` line; lines resolved before it are kept.
pub async fn resolve_batch<R, S>(reader: R, symbols: &S) -> String
where
    R: AsyncBufRead + Unpin,
    S: SymbolSource + ?Sized,
{
    let mut response = String::new();
    let mut tokens = AddressTokens::new(reader);
    while let Some(item) = tokens.next_address().await {
        match item {
            Ok(0) => {},
            Ok(address) => {
                response.push_str(&resolve_blocking(symbols, address));
                response.push('\n');
            },
            Err(err) => {
                let _ = writeln!(response, "reading request: {err}");
            },
        }
    }
    response
}

/// Symbol lookups can read debug info from disk. On a multi-threaded runtime
/// the worker hands its queue to another thread while one runs.
fn resolve_blocking<S>(symbols: &S, address: u64) -> String
where
    S: SymbolSource + ?Sized,
{
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => {
            tokio::task::block_in_place(|| symbols.resolve(address))
        },
        _ => symbols.resolve(address),
    }
}
