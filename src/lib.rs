//! Gatepass: QR-credential attendance for gated events.
//!
//! This crate provides:
//! - Authenticated-encryption credential tokens, one per participant
//! - A contention-safe SQLite attendance store (mark present at most once)
//! - A verification engine with duplicate suppression and scan debouncing
//! - Roster import, batch issuance, and attendance export packs
//!
//! The CLI wrapper lives in `src/main.rs`.

#![deny(unsafe_code)]

pub mod error;
pub mod config;

pub mod debounce;
pub mod engine;
pub mod export;
pub mod import;
pub mod issue;
pub mod store;
pub mod token;
pub mod util;
