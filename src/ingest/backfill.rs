//! Derived-field backfill for rows committed before their calibration existed.

use anyhow::Result;
use tracing::debug;

use crate::ingest::validator::derive_moisture;
use crate::models::{join_faults, Derived};
use crate::store::{CalibrationResolver, ReadingLog};

// ---

/// Scan position of the backfill, by reading id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillCursor {
    pub after_id: i64,
}

/// Process one batch of uncalibrated rows; returns how many were filled.
///
/// The cursor moves past every row examined and wraps to the start once a
/// batch comes back short, so rows that still have no calibration are
/// revisited on the next lap.
pub async fn run_batch<S>(store: &S, cursor: &mut BackfillCursor, batch: i64) -> Result<usize>
where
    S: ReadingLog + CalibrationResolver + ?Sized,
{
    // ---
    let rows = store.uncalibrated_after(cursor.after_id, batch).await?;
    let mut filled = 0;

    for row in &rows {
        if let Some(calibration) = store.resolve(row.probe_id, row.ts).await? {
            let derived = derive_moisture(row.moisture_raw, Some(&calibration));

            let mut faults: Vec<String> = row
                .err
                .as_deref()
                .map(|e| e.split(',').map(String::from).collect())
                .unwrap_or_default();
            faults.extend(derived.faults);

            let update = Derived {
                moisture_pct: derived.moisture_pct,
                calibration_id: derived.calibration_id,
                err: join_faults(&faults),
            };
            if store.backfill_derived(row.id, &update).await? {
                debug!(id = row.id, probe_id = row.probe_id, "backfilled reading");
                filled += 1;
            }
        }
        cursor.after_id = row.id;
    }

    if (rows.len() as i64) < batch {
        cursor.after_id = 0;
    }
    Ok(filled)
}
