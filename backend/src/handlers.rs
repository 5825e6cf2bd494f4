//! Axum handlers for the profiling endpoints.

use std::{io, sync::Arc};

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::{
    allocator::SharedSymbols,
    control::{ProfilingController, Transition},
    dump::{DumpArtifact, DumpError, HeapDumpPipeline},
    symbolize::{resolve_batch, CAPABILITY_LINE},
};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const NOSNIFF: &str = "nosniff";
const HEAP_PROFILE_DISPOSITION: &str = "attachment; filename=\"heap.prof\"";

/// Everything the profiling endpoints share.
#[derive(Clone)]
pub struct AppState {
    /// Serializes sampling toggles against dumps.
    pub controller: Arc<ProfilingController>,
    /// Temp-file pipeline for heap profiles and stats reports.
    pub pipeline: Arc<HeapDumpPipeline>,
    /// Address resolver for `pprof/symbol`.
    pub symbols: SharedSymbols,
}

impl AppState {
    /// Builds the state around one controller.
    pub fn new(
        controller: Arc<ProfilingController>,
        pipeline: HeapDumpPipeline,
        symbols: SharedSymbols,
    ) -> Self {
        Self {
            controller,
            pipeline: Arc::new(pipeline),
            symbols,
        }
    }
}

/// Query of the `active` endpoint.
#[derive(Debug, Deserialize)]
pub struct ActiveQuery {
    /// Decimal integer; kept raw so a bad value yields a readable 400.
    #[serde(default)]
    pub enable: Option<String>,
}

/// Query of the `stats` endpoint.
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// `malloc_stats_print` option letters.
    #[serde(default)]
    pub opts: Option<String>,
}

/// `GET active?enable=<int>`: non-zero turns sampling on, zero turns it off.
pub async fn active(State(state): State<AppState>, Query(query): Query<ActiveQuery>) -> Response {
    let raw = query.enable.unwrap_or_default();
    let transition = match raw.parse::<i64>() {
        Ok(value) => Transition::from_flag(value),
        Err(err) => {
            return plain_error(StatusCode::BAD_REQUEST, format!("invalid enable value, {err}"));
        },
    };

    let controller = Arc::clone(&state.controller);
    let outcome = tokio::task::spawn_blocking(move || controller.apply(transition)).await;
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("jemalloc memory profiling {}", transition.past_tense());
            plain_text(format!("jemalloc memprof {}", transition.past_tense()))
        },
        Ok(Err(err)) => plain_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("could not {transition} jemalloc memory profiling, {err}"),
        ),
        Err(err) => plain_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("could not {transition} jemalloc memory profiling, {err}"),
        ),
    }
}

/// `GET pprof/heap`: dumps a fresh heap profile and streams it back.
pub async fn heap(State(state): State<AppState>) -> Response {
    let pipeline = Arc::clone(&state.pipeline);
    match run_capture(move || pipeline.capture_heap()).await {
        Ok(artifact) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            headers.insert(
                header::CONTENT_DISPOSITION,
                HeaderValue::from_static(HEAP_PROFILE_DISPOSITION),
            );
            stream_artifact(artifact, headers)
        },
        Err(response) => response,
    }
}

/// `GET stats?opts=<letters>`: allocator statistics report, JSON when `opts`
/// contains `J`.
pub async fn stats(State(state): State<AppState>, Query(query): Query<StatsQuery>) -> Response {
    let opts = query.opts.unwrap_or_default();
    let content_type = if opts.contains('J') {
        "application/json"
    } else {
        TEXT_PLAIN
    };
    let pipeline = Arc::clone(&state.pipeline);
    match run_capture(move || pipeline.capture_stats(&opts)).await {
        Ok(artifact) => {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            stream_artifact(artifact, headers)
        },
        Err(response) => response,
    }
}

/// `POST pprof/symbol` resolves `+`-separated addresses; any other method
/// reports that symbols are available.
pub async fn symbol(State(state): State<AppState>, method: Method, body: Body) -> Response {
    if method != Method::POST {
        return plain_text(CAPABILITY_LINE);
    }
    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    plain_text(resolve_batch(reader, state.symbols.as_ref()).await)
}

/// `GET pprof/cmdline`: the process arguments joined by NUL bytes.
pub async fn cmdline() -> Response {
    plain_text(command_line())
}

pub(crate) fn command_line() -> String {
    std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("\x00")
}

async fn run_capture<F>(capture: F) -> Result<DumpArtifact, Response>
where
    F: FnOnce() -> Result<DumpArtifact, DumpError> + Send + 'static,
{
    match tokio::task::spawn_blocking(capture).await {
        Ok(Ok(artifact)) => Ok(artifact),
        Ok(Err(err)) => Err(plain_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
        Err(err) => Err(plain_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("dump task failed, {err}"),
        )),
    }
}

fn stream_artifact(artifact: DumpArtifact, mut headers: HeaderMap) -> Response {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(artifact.len()));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static(NOSNIFF));
    let file = tokio::fs::File::from_std(artifact.into_file());
    (StatusCode::OK, headers, Body::from_stream(ReaderStream::new(file))).into_response()
}

fn plain_text(body: impl Into<Body>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, TEXT_PLAIN),
            (header::X_CONTENT_TYPE_OPTIONS, NOSNIFF),
        ],
        body.into(),
    )
        .into_response()
}

fn plain_error(status: StatusCode, message: String) -> Response {
    if status.is_server_error() {
        tracing::error!("{message}");
    } else {
        tracing::warn!("{message}");
    }
    (
        status,
        [
            (header::CONTENT_TYPE, TEXT_PLAIN),
            (header::X_CONTENT_TYPE_OPTIONS, NOSNIFF),
        ],
        format!("{message}\n"),
    )
        .into_response()
}
