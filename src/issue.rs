//! Credential issuance over the imported roster.
//!
//! Issuance is a finite batch: every roster entry gets a fresh credential,
//! failures are collected per participant, and the batch always runs to the
//! end.  The scannable token text is optionally written out as one file per
//! participant for the external rendering/delivery step.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{OptionExt as _, Result, ResultExt as _};
use crate::store::AttendanceStore;
use crate::token::{Credential, TokenIssuer};

// ---------------------------------------------------------------------------
// Summary types
// ---------------------------------------------------------------------------

/// One participant whose issuance failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueFailure {
    pub participant_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IssueSummary {
    pub issued: usize,
    pub failures: Vec<IssueFailure>,
}

// ---------------------------------------------------------------------------
// Issuance
// ---------------------------------------------------------------------------

/// Issue a fresh credential for every participant in the roster.
///
/// Each success replaces any previously stored credential for that
/// participant; earlier tokens keep decoding but stop matching by stored
/// text.
pub fn issue_all(
    store: &AttendanceStore,
    issuer: &TokenIssuer,
    tokens_dir: Option<&Path>,
) -> Result<IssueSummary> {
    if let Some(dir) = tokens_dir {
        std::fs::create_dir_all(dir)
            .ctx_issue(&format!("create tokens dir {}", dir.display()))?;
    }

    let mut summary = IssueSummary::default();
    for participant in store.list_participants()? {
        match issue_for(store, issuer, &participant.participant_id, tokens_dir) {
            Ok(_) => summary.issued += 1,
            Err(e) => {
                let reason = e.to_string();
                warn!(identifier = %participant.participant_id, %reason, "issuance failed");
                summary.failures.push(IssueFailure {
                    participant_id: participant.participant_id,
                    reason,
                });
            }
        }
    }

    info!(
        issued = summary.issued,
        failed = summary.failures.len(),
        "issuance batch complete"
    );
    Ok(summary)
}

/// Issue (or re-issue) a credential for one known participant.
pub fn issue_one(
    store: &AttendanceStore,
    issuer: &TokenIssuer,
    participant_id: &str,
    tokens_dir: Option<&Path>,
) -> Result<Credential> {
    store
        .find_participant(participant_id)?
        .required_issue(&format!("unknown participant '{participant_id}'"))?;
    let cred = issue_for(store, issuer, participant_id, tokens_dir)?;
    info!(identifier = %participant_id, "credential issued");
    Ok(cred)
}

fn issue_for(
    store: &AttendanceStore,
    issuer: &TokenIssuer,
    participant_id: &str,
    tokens_dir: Option<&Path>,
) -> Result<Credential> {
    let cred = issuer.issue(participant_id)?;
    store.upsert_credential(&cred)?;
    if let Some(dir) = tokens_dir {
        write_token_artifact(dir, &cred)?;
    }
    Ok(cred)
}

/// Write the scannable token text for the external rendering step.
/// Validated identifiers contain only `[A-Za-z0-9._-]`, so the identifier
/// itself serves as the file stem.
fn write_token_artifact(dir: &Path, cred: &Credential) -> Result<PathBuf> {
    let path = dir.join(format!("{}.txt", cred.participant_id));
    std::fs::write(&path, format!("{}\n", cred.token))
        .ctx_issue(&format!("write {}", path.display()))?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::error::GatepassError;
    use crate::store::Participant;
    use crate::token::TokenCodec;
    use secrecy::SecretString;

    fn fixture() -> (tempfile::TempDir, AttendanceStore, TokenCodec, TokenIssuer) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            AttendanceStore::open(&dir.path().join("attendance.db"), &StoreConfig::default())
                .unwrap();
        let key = SecretString::new(TokenCodec::generate_key().into());
        let codec = TokenCodec::from_base64_key(&key).unwrap();
        let issuer = TokenIssuer::new(codec.clone());
        (dir, store, codec, issuer)
    }

    fn seed(store: &AttendanceStore, ids: &[&str]) {
        for id in ids {
            store
                .upsert_participant(&Participant {
                    participant_id: id.to_string(),
                    name: format!("Name {id}"),
                    contact: format!("{id}@example.edu"),
                })
                .unwrap();
        }
    }

    #[test]
    fn batch_issues_one_credential_per_participant() {
        let (_dir, store, codec, issuer) = fixture();
        seed(&store, &["R001", "R002", "R003"]);

        let summary = issue_all(&store, &issuer, None).unwrap();
        assert_eq!(summary.issued, 3);
        assert!(summary.failures.is_empty());

        for id in ["R001", "R002", "R003"] {
            let cred = store.credential(id).unwrap().unwrap();
            let (decoded_id, _) = codec.decode(&cred.token).unwrap();
            assert_eq!(decoded_id, id);
        }
    }

    #[test]
    fn batch_writes_token_artifacts() {
        let (dir, store, _codec, issuer) = fixture();
        seed(&store, &["R001", "R002"]);
        let tokens_dir = dir.path().join("tokens");

        let summary = issue_all(&store, &issuer, Some(&tokens_dir)).unwrap();
        assert_eq!(summary.issued, 2);

        for id in ["R001", "R002"] {
            let text = std::fs::read_to_string(tokens_dir.join(format!("{id}.txt"))).unwrap();
            let stored = store.credential(id).unwrap().unwrap();
            assert_eq!(text.trim_end(), stored.token);
        }
    }

    #[test]
    fn reissue_replaces_stored_credential() {
        let (_dir, store, _codec, issuer) = fixture();
        seed(&store, &["R001"]);

        issue_all(&store, &issuer, None).unwrap();
        let first = store.credential("R001").unwrap().unwrap();

        issue_all(&store, &issuer, None).unwrap();
        let second = store.credential("R001").unwrap().unwrap();

        assert_ne!(first.token, second.token);
        assert!(store.find_participant_by_token(&first.token).unwrap().is_none());
        assert!(store.find_participant_by_token(&second.token).unwrap().is_some());
    }

    #[test]
    fn invalid_identifier_in_store_is_collected() {
        let (_dir, store, _codec, issuer) = fixture();
        seed(&store, &["R001", "has space"]);

        let summary = issue_all(&store, &issuer, None).unwrap();
        assert_eq!(summary.issued, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].participant_id, "has space");

        assert!(store.credential("R001").unwrap().is_some());
        assert!(store.credential("has space").unwrap().is_none());
    }

    #[test]
    fn issue_one_unknown_participant_errors() {
        let (_dir, store, _codec, issuer) = fixture();

        let err = issue_one(&store, &issuer, "R999", None).unwrap_err();
        assert!(matches!(err, GatepassError::Issue(_)));
        assert!(err.to_string().contains("unknown participant"));
    }

    #[test]
    fn issue_one_returns_the_stored_credential() {
        let (_dir, store, _codec, issuer) = fixture();
        seed(&store, &["R001"]);

        let cred = issue_one(&store, &issuer, "R001", None).unwrap();
        let stored = store.credential("R001").unwrap().unwrap();
        assert_eq!(cred, stored);
    }
}
