//! Attendance export pack: the log as CSV plus a JSON manifest.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GatepassError, Result, ResultExt as _};
use crate::store::AttendanceStore;
use crate::util;

// ---------------------------------------------------------------------------
// Pack contents
// ---------------------------------------------------------------------------

/// One exported attendance line.  `name`/`contact` are blank when the log
/// row has no matching roster entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRow {
    pub participant_id: String,
    pub ts_utc: String,
    pub source: String,
    pub note: String,
    pub name: String,
    pub contact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendancePackManifest {
    pub format: String,
    pub generated_at_utc: String,
    pub attendance_rows: usize,
    pub participants: usize,
}

// ---------------------------------------------------------------------------
// Pack writer
// ---------------------------------------------------------------------------

/// Write `attendance.csv` and `manifest.json` under `out_dir`, creating the
/// directory if needed.  Rows come out in verification order.
pub fn write_attendance_pack(
    store: &AttendanceStore,
    out_dir: &Path,
) -> Result<AttendancePackManifest> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| GatepassError::Export(format!("create out dir {}: {e}", out_dir.display())))?;

    let rows = store.list_attendance_joined()?;

    let csv_path = out_dir.join("attendance.csv");
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(&csv_path)
        .map_err(|e| GatepassError::Export(format!("open {}: {e}", csv_path.display())))?;
    // Written explicitly so an empty log still gets a header line; the
    // column order must match the ExportRow field order.
    wtr.write_record(["participant_id", "ts_utc", "source", "note", "name", "contact"])
        .ctx_export("write attendance header")?;
    for row in &rows {
        wtr.serialize(ExportRow {
            participant_id: row.record.participant_id.clone(),
            ts_utc: row.record.ts_utc.clone(),
            source: row.record.source.clone(),
            note: row.record.note.clone(),
            name: row.name.clone().unwrap_or_default(),
            contact: row.contact.clone().unwrap_or_default(),
        })
        .ctx_export("write attendance row")?;
    }
    wtr.flush().ctx_export("flush attendance.csv")?;

    let manifest = AttendancePackManifest {
        format: "gatepass attendance-pack v1".to_string(),
        generated_at_utc: util::now_utc_rfc3339(),
        attendance_rows: rows.len(),
        participants: store.count_participants()? as usize,
    };
    let manifest_path = out_dir.join("manifest.json");
    let manifest_json = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| GatepassError::Export(format!("serialize manifest: {e}")))?;
    std::fs::write(&manifest_path, manifest_json)
        .map_err(|e| GatepassError::Export(format!("write {}: {e}", manifest_path.display())))?;

    Ok(manifest)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::Participant;

    fn test_store(dir: &tempfile::TempDir) -> AttendanceStore {
        AttendanceStore::open(&dir.path().join("attendance.db"), &StoreConfig::default()).unwrap()
    }

    fn read_rows(path: &Path) -> Vec<ExportRow> {
        let mut rdr = csv::Reader::from_path(path).unwrap();
        rdr.deserialize().collect::<std::result::Result<_, _>>().unwrap()
    }

    #[test]
    fn empty_log_still_writes_header_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let out = dir.path().join("report");

        let manifest = write_attendance_pack(&store, &out).unwrap();
        assert_eq!(manifest.attendance_rows, 0);
        assert_eq!(manifest.participants, 0);

        let csv_text = std::fs::read_to_string(out.join("attendance.csv")).unwrap();
        assert!(csv_text.starts_with("participant_id,ts_utc,source,note,name,contact"));
        assert!(read_rows(&out.join("attendance.csv")).is_empty());
    }

    #[test]
    fn rows_join_roster_fields_in_verification_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        for (id, name) in [("R002", "Grace"), ("R001", "Ada")] {
            store
                .upsert_participant(&Participant {
                    participant_id: id.to_string(),
                    name: name.to_string(),
                    contact: format!("{id}@example.edu"),
                })
                .unwrap();
        }
        store.record_attendance("R002", "live_scan", "").unwrap();
        store.record_attendance("R001", "live_scan", "late").unwrap();
        store.record_attendance("GHOST", "manual", "").unwrap();

        let out = dir.path().join("report");
        let manifest = write_attendance_pack(&store, &out).unwrap();
        assert_eq!(manifest.attendance_rows, 3);
        assert_eq!(manifest.participants, 2);

        let rows = read_rows(&out.join("attendance.csv"));
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].participant_id, "R002");
        assert_eq!(rows[0].name, "Grace");
        assert_eq!(rows[1].participant_id, "R001");
        assert_eq!(rows[1].note, "late");
        assert_eq!(rows[2].participant_id, "GHOST");
        assert_eq!(rows[2].name, "");
        assert_eq!(rows[2].contact, "");
    }

    #[test]
    fn exported_timestamps_keep_second_precision_utc() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        store
            .upsert_participant(&Participant {
                participant_id: "R001".to_string(),
                name: "Ada".to_string(),
                contact: "a@b.c".to_string(),
            })
            .unwrap();
        store.record_attendance("R001", "live_scan", "").unwrap();

        let out = dir.path().join("report");
        write_attendance_pack(&store, &out).unwrap();

        let rows = read_rows(&out.join("attendance.csv"));
        assert!(rows[0].ts_utc.ends_with('Z'));
        assert!(!rows[0].ts_utc.contains('.'));
    }

    #[test]
    fn manifest_parses_back_with_format_tag() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let out = dir.path().join("report");
        write_attendance_pack(&store, &out).unwrap();

        let bytes = std::fs::read(out.join("manifest.json")).unwrap();
        let manifest: AttendancePackManifest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(manifest.format, "gatepass attendance-pack v1");
        assert!(manifest.generated_at_utc.ends_with('Z'));
    }
}
