//! Size-bounded, paged export of dataset rows.

use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::backup::ArchiveError;
use crate::backup::artifact::ArtifactWriter;
use crate::dataset::Dataset;
use crate::store::{ExportBatch, ExportMode, JobStorage};

/// Keep the longest prefix of `rows` whose cumulative size stays within
/// `max_payload_bytes`. The first row is always kept so a single oversized
/// row cannot stall an export.
pub fn window_by_payload<T>(
    mut rows: Vec<T>,
    max_payload_bytes: u64,
    size_of: impl Fn(&T) -> u64,
) -> Vec<T> {
    let mut running: u64 = 0;
    let mut keep = 0;
    for (i, row) in rows.iter().enumerate() {
        running = running.saturating_add(size_of(row));
        if i > 0 && running > max_payload_bytes {
            break;
        }
        keep = i + 1;
    }
    rows.truncate(keep);
    rows
}

/// Page through one export of `dataset` and append every row to `writer`.
///
/// Returns the number of rows written. Stops early when `cancel` fires.
pub async fn export_rows(
    store: &dyn JobStorage,
    dataset: &Dataset,
    mode: ExportMode,
    batch_rows: usize,
    max_payload_bytes: u64,
    writer: &mut ArtifactWriter,
    cancel: &CancellationToken,
) -> Result<u64, ArchiveError> {
    let total = store
        .count_export_rows(dataset, mode)
        .await
        .map_err(|e| ArchiveError::ExportFailure(format!("counting {} rows: {e}", mode.as_str())))?;

    let mut offset: u64 = 0;
    while offset < total {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let rows: Vec<JsonValue> = store
            .export_batch(
                dataset,
                mode,
                &ExportBatch {
                    offset,
                    limit: batch_rows,
                    max_payload_bytes,
                },
            )
            .await
            .map_err(|e| {
                ArchiveError::ExportFailure(format!("{} batch at offset {offset}: {e}", mode.as_str()))
            })?;
        if rows.is_empty() {
            break;
        }

        for row in &rows {
            writer
                .write_row(row)
                .map_err(|e| ArchiveError::ExportFailure(format!("writing {}: {e}", writer.path().display())))?;
        }
        offset += rows.len() as u64;
        tracing::trace!(dataset = %dataset, mode = mode.as_str(), offset, total, "exported batch");
    }

    Ok(offset)
}
