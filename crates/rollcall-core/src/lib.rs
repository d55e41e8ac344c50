//! rollcall-core — Attendance ledger engine.
//!
//! Loads enrolled reference encodings, matches live face encodings against
//! them, and maintains the per-person, per-date attendance ledger.

pub mod encodings;
pub mod ledger;
pub mod matcher;
pub mod types;

pub use encodings::{EncodingStore, LoadError, StoreError};
pub use ledger::{CorruptLedgerError, Ledger, LedgerError, PersistenceError, Status};
pub use matcher::{FirstMatch, MatchOutcome, Matcher, NearestMatch, DEFAULT_TOLERANCE};
pub use types::{Embedding, Identity, Region};

use std::path::PathBuf;

/// Default data directory: `$XDG_DATA_HOME/rollcall`, falling back to
/// `$HOME/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Default encoding store artifact path.
pub fn default_encodings_path() -> PathBuf {
    std::env::var("ROLLCALL_ENCODINGS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_data_dir().join("faces.json"))
}

/// Default attendance ledger artifact path.
pub fn default_ledger_path() -> PathBuf {
    std::env::var("ROLLCALL_LEDGER_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_data_dir().join("attendance.csv"))
}
