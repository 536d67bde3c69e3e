//! Gzip-compressed JSON-lines artifacts in a scratch directory.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::Value as JsonValue;

use crate::dataset::{Dataset, DatasetIndex, DatasetRange};

/// `{job_table}.{min_job_id}.{max_job_id}.{start_ms}.{end_ms}.gz`
pub fn jobs_artifact_name(range: &DatasetRange) -> String {
    format!(
        "{}.{}.{}.{}.{}.gz",
        range.dataset.job_table, range.min_job_id, range.max_job_id, range.start_ms, range.end_ms
    )
}

/// `{status_table}.gz`
pub fn status_artifact_name(dataset: &Dataset) -> String {
    format!("{}.gz", dataset.status_table)
}

/// `{status_table}_aborted.gz`
pub fn failed_only_artifact_name(dataset: &Dataset) -> String {
    format!("{}_aborted.gz", dataset.status_table)
}

fn is_own_artifact(prefix: &str, file_name: &str) -> bool {
    let Some(stem) = file_name.split('.').next() else {
        return false;
    };
    if !file_name.ends_with(".gz") {
        return false;
    }
    let stem = stem.strip_suffix("_aborted").unwrap_or(stem);
    Dataset::from_job_table(prefix, stem).is_some()
        || stem
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix("_job_status_"))
            .is_some_and(|index| index.parse::<DatasetIndex>().is_ok())
}

/// Remove artifacts of `prefix` left behind by an interrupted process.
pub async fn remove_stale_scratch(dir: &Path, prefix: &str) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_own_artifact(prefix, name) {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(dir = %dir.display(), prefix, removed, "removed stale backup artifacts");
    }
    Ok(removed)
}

/// A file that is deleted when dropped.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch file");
        }
    }
}

/// Streams JSON rows into a gzip file, one object per line.
///
/// The file is removed if the writer is dropped before `finish`, and when
/// the returned `ScratchFile` is dropped after it.
pub struct ArtifactWriter {
    // Declared before `scratch`: the file is closed before it is removed.
    encoder: GzEncoder<BufWriter<File>>,
    scratch: ScratchFile,
    rows: u64,
}

impl ArtifactWriter {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self {
            encoder: GzEncoder::new(BufWriter::new(file), Compression::default()),
            scratch: ScratchFile { path },
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        self.scratch.path()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn write_row(&mut self, row: &JsonValue) -> io::Result<()> {
        serde_json::to_writer(&mut self.encoder, row)?;
        self.encoder.write_all(b"\n")?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and sync the artifact, handing back ownership of the file.
    pub fn finish(self) -> io::Result<ScratchFile> {
        let Self { encoder, scratch, .. } = self;
        let file = encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(scratch)
    }
}

impl std::fmt::Debug for ArtifactWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactWriter")
            .field("path", &self.scratch.path)
            .field("rows", &self.rows)
            .finish()
    }
}
