//! Dump-then-serve pipeline for heap profiles and allocator stats reports.
//!
//! Every capture writes into its own `memprofile-*.dump` temp file. The file is
//! owned by a [`NamedTempFile`] guard from creation on, so any early return
//! removes it. On success the path is unlinked before the artifact is handed
//! out; only the open handle survives, and closing it frees the data.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tempfile::{Builder, NamedTempFile};

use crate::{allocator::Status, control::ProfilingController};

const DUMP_FILE_PREFIX: &str = "memprofile-";
const DUMP_FILE_SUFFIX: &str = ".dump";
const STATS_FILE_PREFIX: &str = "memstats-";

/// Why a capture produced no artifact.
#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    /// The temp file could not be created; no native call was made.
    #[error("could not create temp file to dump, {0}")]
    TempFile(#[source] io::Error),
    /// The allocator refused to write the profile.
    #[error("could not dump memory profile, dump into {} failed with code {code}", path.display())]
    Profile {
        /// Temp file handed to the allocator.
        path: PathBuf,
        /// Allocator status.
        code: Status,
    },
    /// The allocator could not write the stats report.
    #[error("could not dump allocator stats, report into {} failed with code {code}", path.display())]
    Stats {
        /// Temp file handed to the allocator.
        path: PathBuf,
        /// Allocator status.
        code: Status,
    },
    /// The written artifact could not be reopened for serving.
    #[error("could not read dump artifact, {0}")]
    Artifact(#[source] io::Error),
}

/// A captured snapshot, already unlinked from the filesystem.
#[derive(Debug)]
pub struct DumpArtifact {
    file: File,
    len: u64,
}

impl DumpArtifact {
    /// Size of the snapshot in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the allocator wrote nothing.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read handle positioned at the start of the snapshot.
    pub fn into_file(self) -> File {
        self.file
    }
}

/// Captures heap profiles and stats reports into request-scoped temp files.
pub struct HeapDumpPipeline {
    controller: Arc<ProfilingController>,
    dump_dir: PathBuf,
}

impl HeapDumpPipeline {
    /// Temp files are created inside `dump_dir`.
    pub fn new(controller: Arc<ProfilingController>, dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            controller,
            dump_dir: dump_dir.into(),
        }
    }

    /// Dumps the heap profile under the controller's shared lock.
    pub fn capture_heap(&self) -> Result<DumpArtifact, DumpError> {
        let scratch = self.scratch_file(DUMP_FILE_PREFIX)?;
        self.controller
            .dump_profile(scratch.path())
            .map_err(|code| DumpError::Profile {
                path: scratch.path().to_path_buf(),
                code,
            })?;
        finish(scratch)
    }

    /// Writes a `malloc_stats_print` report. Counter reads take no lock.
    pub fn capture_stats(&self, opts: &str) -> Result<DumpArtifact, DumpError> {
        let scratch = self.scratch_file(STATS_FILE_PREFIX)?;
        match self
            .controller
            .allocator()
            .dump_stats(scratch.path(), opts)
        {
            0 => finish(scratch),
            code => Err(DumpError::Stats {
                path: scratch.path().to_path_buf(),
                code,
            }),
        }
    }

    /// Directory the temp files are created in.
    pub fn dump_dir(&self) -> &Path {
        &self.dump_dir
    }

    fn scratch_file(&self, prefix: &str) -> Result<NamedTempFile, DumpError> {
        Builder::new()
            .prefix(prefix)
            .suffix(DUMP_FILE_SUFFIX)
            .tempfile_in(&self.dump_dir)
            .map_err(DumpError::TempFile)
    }
}

fn finish(scratch: NamedTempFile) -> Result<DumpArtifact, DumpError> {
    // The allocator rewrote the file in place through its path, so the handle
    // we hold sees the new contents from offset 0.
    let len = scratch
        .as_file()
        .metadata()
        .map_err(DumpError::Artifact)?
        .len();
    let file = scratch.into_file();
    Ok(DumpArtifact {
        file,
        len,
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, io::Read, thread};

    use super::*;
    use crate::fake::FakeAllocator;

    fn pipeline_in(dir: &Path, fake: &Arc<FakeAllocator>) -> HeapDumpPipeline {
        let controller = Arc::new(ProfilingController::new(fake.clone()));
        HeapDumpPipeline::new(controller, dir)
    }

    fn read_all(artifact: DumpArtifact) -> Vec<u8> {
        let mut bytes = Vec::new();
        artifact
            .into_file()
            .read_to_end(&mut bytes)
            .expect("read artifact");
        bytes
    }

    fn leftover_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).expect("read dir").count()
    }

    #[test]
    fn capture_returns_profile_and_leaves_nothing_on_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let profile = b"heap_v2/1\n  t*: 1: 32 [0: 0]\n";
        let fake = Arc::new(FakeAllocator::new().with_profile(profile.to_vec()));
        let pipeline = pipeline_in(dir.path(), &fake);

        let artifact = pipeline.capture_heap().expect("capture");
        assert_eq!(artifact.len(), profile.len() as u64);
        let paths = fake.dump_paths();
        assert_eq!(paths.len(), 1);
        let name = paths[0]
            .file_name()
            .and_then(|name| name.to_str())
            .expect("utf8 name");
        assert!(name.starts_with("memprofile-") && name.ends_with(".dump"), "{name}");
        assert!(!paths[0].exists());

        assert_eq!(read_all(artifact), profile);
        assert_eq!(leftover_files(dir.path()), 0);
    }

    #[test]
    fn failed_dump_removes_the_artifact() {
        let dir = tempfile::tempdir().expect("temp dir");
        let fake = Arc::new(FakeAllocator::new());
        fake.set_dump_status(libc::ENOENT);
        let pipeline = pipeline_in(dir.path(), &fake);

        let err = pipeline.capture_heap().expect_err("dump must fail");
        let path = fake.dump_paths().pop().expect("dump attempted");
        match &err {
            DumpError::Profile {
                path: failed,
                code,
            } => {
                assert_eq!(failed, &path);
                assert_eq!(*code, libc::ENOENT);
            },
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().starts_with("could not dump memory profile, "));
        assert!(!path.exists());
        assert_eq!(leftover_files(dir.path()), 0);
    }

    #[test]
    fn temp_file_failure_skips_the_native_call() {
        let dir = tempfile::tempdir().expect("temp dir");
        let fake = Arc::new(FakeAllocator::new());
        let pipeline = pipeline_in(&dir.path().join("missing"), &fake);

        let err = pipeline.capture_heap().expect_err("temp file must fail");
        assert!(matches!(err, DumpError::TempFile(_)), "{err:?}");
        assert!(err
            .to_string()
            .starts_with("could not create temp file to dump, "));
        assert!(fake.dump_paths().is_empty());
    }

    #[test]
    fn concurrent_captures_use_distinct_artifacts() {
        let dir = tempfile::tempdir().expect("temp dir");
        let fake = Arc::new(FakeAllocator::new().with_profile("snapshot"));
        let pipeline = Arc::new(pipeline_in(dir.path(), &fake));

        let handles = (0..8)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                thread::spawn(move || pipeline.capture_heap().map(read_all))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            let bytes = handle.join().expect("capture thread").expect("capture");
            assert_eq!(bytes, b"snapshot");
        }

        let unique = fake.dump_paths().into_iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), 8);
        assert_eq!(leftover_files(dir.path()), 0);
    }

    #[test]
    fn stats_capture_passes_options_through() {
        let dir = tempfile::tempdir().expect("temp dir");
        let fake = Arc::new(FakeAllocator::new());
        let pipeline = pipeline_in(dir.path(), &fake);

        let bytes = read_all(pipeline.capture_stats("J").expect("stats"));
        assert_eq!(bytes, b"{\"jemalloc\":{}}\n");
        let requests = fake.stats_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1, "J");
        assert!(!requests[0].0.exists());
        assert_eq!(leftover_files(dir.path()), 0);
    }
}
