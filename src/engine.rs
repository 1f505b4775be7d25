//! The checkpoint verification engine.
//!
//! One engine instance serves one checkpoint.  An external scan source
//! (camera decoder, stdin feed, test driver) calls
//! [`VerificationEngine::handle`] with each observed string; the engine
//! debounces, decodes, looks up, duplicate-checks, records, and hands the
//! outcome to the injected observer.  Expected outcomes never raise; nothing in the scan path
//! panics or blocks past the store's bounded retry budget.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::debounce::DebounceCache;
use crate::error::Result;
use crate::store::{AttendanceStore, Participant, RecordOutcome};
use crate::token::{DecodeError, TokenCodec};

// ---------------------------------------------------------------------------
// Outcomes and observer
// ---------------------------------------------------------------------------

/// Terminal outcome of one scan.  Suppressed scans emit nothing.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    /// The string did not decode to a credential payload.
    Invalid { reason: DecodeError },
    /// Decoded cleanly but matched no stored participant.
    Unknown { participant_id: String },
    /// Participant already has an attendance record.
    Duplicate { participant: Participant },
    /// First presentation; attendance recorded.
    Verified {
        participant: Participant,
        ts_utc: String,
    },
    /// The store stayed unavailable past the retry budget (or failed
    /// outright); operational, the scan loop keeps running.
    StoreError { message: String },
}

/// Sink for scan outcomes, invoked synchronously once per emitted outcome.
///
/// Implementations must return promptly and must not panic; presentation
/// work (overlay, notification, console line) happens on the far side of
/// this trait.
pub trait ScanObserver: Send + Sync {
    fn on_outcome(&self, outcome: &ScanOutcome);
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct VerificationEngine {
    codec: TokenCodec,
    store: AttendanceStore,
    debounce: DebounceCache,
    observer: Arc<dyn ScanObserver>,
    source: String,
}

impl std::fmt::Debug for VerificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationEngine")
            .field("source", &self.source)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

impl VerificationEngine {
    pub fn new(
        codec: TokenCodec,
        store: AttendanceStore,
        debounce: DebounceCache,
        observer: Arc<dyn ScanObserver>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            codec,
            store,
            debounce,
            observer,
            source: source.into(),
        }
    }

    /// Process one observed scan string.
    ///
    /// Returns the emitted outcome, or `None` when the debounce cache
    /// suppressed the observation.  Safe to call concurrently from several
    /// scan workers; the store serializes all mutation.
    pub fn handle(&self, raw: &str) -> Option<ScanOutcome> {
        if !self.debounce.admit(raw) {
            return None;
        }

        let (participant_id, _nonce) = match self.codec.decode(raw) {
            Ok(parts) => parts,
            Err(reason) => return self.emit(ScanOutcome::Invalid { reason }),
        };

        let participant = match self.lookup(&participant_id, raw) {
            Ok(Some(p)) => p,
            Ok(None) => return self.emit(ScanOutcome::Unknown { participant_id }),
            Err(e) => {
                return self.emit(ScanOutcome::StoreError {
                    message: e.to_string(),
                })
            }
        };

        match self.store.has_attendance(&participant.participant_id) {
            Ok(true) => return self.emit(ScanOutcome::Duplicate { participant }),
            Ok(false) => {}
            Err(e) => {
                return self.emit(ScanOutcome::StoreError {
                    message: e.to_string(),
                })
            }
        }

        match self
            .store
            .record_attendance(&participant.participant_id, &self.source, "")
        {
            Ok(RecordOutcome::Recorded { ts_utc }) => {
                self.emit(ScanOutcome::Verified { participant, ts_utc })
            }
            // Lost the race to a concurrent presentation.
            Ok(RecordOutcome::AlreadyMarked) => self.emit(ScanOutcome::Duplicate { participant }),
            Err(e) => self.emit(ScanOutcome::StoreError {
                message: e.to_string(),
            }),
        }
    }

    /// Identifier lookup is authoritative; the raw-text fallback catches
    /// rows whose stored token matches the scan verbatim.
    fn lookup(&self, participant_id: &str, raw: &str) -> Result<Option<Participant>> {
        if let Some(p) = self.store.find_participant(participant_id)? {
            return Ok(Some(p));
        }
        self.store.find_participant_by_token(raw)
    }

    fn emit(&self, outcome: ScanOutcome) -> Option<ScanOutcome> {
        match &outcome {
            ScanOutcome::Verified { participant, ts_utc } => {
                info!(
                    participant = %participant.participant_id,
                    ts = %ts_utc,
                    source = %self.source,
                    "attendance verified"
                );
            }
            ScanOutcome::Duplicate { participant } => {
                debug!(participant = %participant.participant_id, "duplicate presentation");
            }
            ScanOutcome::Unknown { participant_id } => {
                debug!(participant = %participant_id, "unknown credential");
            }
            ScanOutcome::Invalid { reason } => {
                debug!(reason = %reason, "invalid scan");
            }
            ScanOutcome::StoreError { message } => {
                warn!(error = %message, "attendance store error during scan");
            }
        }
        self.observer.on_outcome(&outcome);
        Some(outcome)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
