//! Roster import from a CSV feed.
//!
//! The feed must expose `name`, `identifier`, and `contact` columns, in any
//! order and any header casing.  A missing column aborts the import before
//! any row is touched; individual bad rows are collected while the rest of
//! the file proceeds.

use std::path::Path;

use tracing::{info, warn};

use crate::error::{GatepassError, Result, ResultExt as _};
use crate::store::{AttendanceStore, Participant};
use crate::util;

// ---------------------------------------------------------------------------
// Summary types
// ---------------------------------------------------------------------------

/// One roster row that could not be imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// Line in the roster file, counting the header as line 1.
    pub line: usize,
    /// Identifier as it appeared in the row; empty when the row itself
    /// could not be parsed.
    pub identifier: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub imported: usize,
    pub failures: Vec<RowFailure>,
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Load a participant roster into the store.
///
/// Re-importing an existing identifier updates its name/contact and leaves
/// any issued credential in place.
pub fn import_roster(store: &AttendanceStore, csv_path: &Path) -> Result<ImportSummary> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .ctx_import(&format!("open roster {}", csv_path.display()))?;

    let headers = rdr.headers().ctx_import("read roster headers")?.clone();
    let column = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                GatepassError::Import(format!("roster missing required column '{name}'"))
            })
    };
    let name_col = column("name")?;
    let id_col = column("identifier")?;
    let contact_col = column("contact")?;

    let mut summary = ImportSummary::default();
    let mut row_count = 0usize;
    for record in rdr.records() {
        row_count += 1;
        if row_count > util::MAX_ROSTER_ROWS {
            return Err(GatepassError::Import(format!(
                "roster exceeds maximum row limit of {}",
                util::MAX_ROSTER_ROWS
            )));
        }
        let line = row_count + 1;

        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!(line, "roster row unreadable: {e}");
                summary.failures.push(RowFailure {
                    line,
                    identifier: String::new(),
                    reason: format!("unreadable row: {e}"),
                });
                continue;
            }
        };

        let field = |col: usize| record.get(col).unwrap_or("").trim().to_string();
        let participant = Participant {
            participant_id: field(id_col),
            name: field(name_col),
            contact: field(contact_col),
        };

        if let Err(e) = util::validate_participant_id(&participant.participant_id) {
            let reason = e.to_string();
            warn!(line, identifier = %participant.participant_id, %reason, "roster row rejected");
            summary.failures.push(RowFailure {
                line,
                identifier: participant.participant_id,
                reason,
            });
            continue;
        }

        store.upsert_participant(&participant)?;
        summary.imported += 1;
    }

    info!(
        roster = %csv_path.display(),
        imported = summary.imported,
        failed = summary.failures.len(),
        "roster import complete"
    );
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
