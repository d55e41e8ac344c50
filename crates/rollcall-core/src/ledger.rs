//! Attendance ledger — identity × date presence table with CSV persistence.
//!
//! Artifact layout:
//!
//! ```text
//! Name,2024-03-01,2024-03-02
//! alice,Present,Absent
//! bob,Absent,Present
//! ```
//!
//! Every row carries one status per date column. Columns are kept in the
//! order they were added (oldest first) and rows in order of first
//! appearance. A `Present` cell is never turned back into `Absent`.

use crate::types::Identity;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Label of the identity column in the header row.
pub const NAME_COLUMN: &str = "Name";
/// Format of date labels in the header row.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Present,
    Absent,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Present => "Present",
            Status::Absent => "Absent",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Present" => Some(Status::Present),
            "Absent" => Some(Status::Absent),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger artifact that cannot be read without guessing. Never repaired
/// automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("corrupt ledger at line {line}: {reason}")]
pub struct CorruptLedgerError {
    pub line: u64,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Corrupt(#[from] CorruptLedgerError),
    #[error("failed to read ledger {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Saving failed. The in-memory ledger is untouched and the save can be retried.
#[derive(Error, Debug)]
#[error("failed to persist ledger to {path}: {source}")]
pub struct PersistenceError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

#[derive(Debug, Clone, PartialEq)]
struct Row {
    identity: Identity,
    cells: Vec<Status>,
}

/// In-memory attendance table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ledger {
    dates: Vec<NaiveDate>,
    rows: Vec<Row>,
    index: HashMap<Identity, usize>,
    /// Write CRLF line endings (artifact was created with them).
    crlf: bool,
}

impl Ledger {
    /// Empty ledger: header `["Name"]`, no rows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the ledger artifact. A missing file yields an empty ledger.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no ledger yet, starting empty");
                return Ok(Self::new());
            }
            Err(e) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let ledger = Self::parse(&bytes)?;
        tracing::debug!(
            path = %path.display(),
            people = ledger.len(),
            dates = ledger.dates.len(),
            "loaded ledger"
        );
        Ok(ledger)
    }

    /// Parse CSV bytes. Empty input is an empty ledger.
    pub fn parse(bytes: &[u8]) -> Result<Self, CorruptLedgerError> {
        let mut ledger = Self::new();
        ledger.crlf = bytes
            .iter()
            .position(|&b| b == b'\n')
            .is_some_and(|nl| nl > 0 && bytes[nl - 1] == b'\r');

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);
        let mut records = reader.records();

        let header = match records.next() {
            None => return Ok(ledger),
            Some(record) => record.map_err(csv_corruption)?,
        };
        let header_line = line_of(&header);

        if header.get(0) != Some(NAME_COLUMN) {
            return Err(CorruptLedgerError {
                line: header_line,
                reason: format!("header must start with {NAME_COLUMN:?}"),
            });
        }
        for label in header.iter().skip(1) {
            let date = parse_date_label(label).ok_or_else(|| CorruptLedgerError {
                line: header_line,
                reason: format!("invalid date column {label:?}"),
            })?;
            if ledger.dates.contains(&date) {
                return Err(CorruptLedgerError {
                    line: header_line,
                    reason: format!("duplicate date column {label}"),
                });
            }
            ledger.dates.push(date);
        }

        for record in records {
            let record = record.map_err(csv_corruption)?;
            let line = line_of(&record);

            if record.len() != header.len() {
                return Err(CorruptLedgerError {
                    line,
                    reason: format!(
                        "expected {} columns, found {}",
                        header.len(),
                        record.len()
                    ),
                });
            }

            let identity = Identity::new(&record[0]).map_err(|e| CorruptLedgerError {
                line,
                reason: e.to_string(),
            })?;
            if ledger.index.contains_key(&identity) {
                return Err(CorruptLedgerError {
                    line,
                    reason: format!("duplicate row for {identity}"),
                });
            }

            let cells = record
                .iter()
                .skip(1)
                .map(|raw| {
                    Status::parse(raw).ok_or_else(|| CorruptLedgerError {
                        line,
                        reason: format!("invalid status {raw:?} for {identity}"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            ledger.index.insert(identity.clone(), ledger.rows.len());
            ledger.rows.push(Row { identity, cells });
        }

        Ok(ledger)
    }

    /// Append `date` as the newest column, backfilling `Absent` on every row.
    ///
    /// Returns `false` if the column already existed.
    pub fn ensure_date_column(&mut self, date: NaiveDate) -> bool {
        if self.dates.contains(&date) {
            return false;
        }
        self.dates.push(date);
        for row in &mut self.rows {
            row.cells.push(Status::Absent);
        }
        tracing::debug!(%date, people = self.rows.len(), "added date column");
        true
    }

    /// Mark `identity` present on `date`.
    ///
    /// Unknown identities get a new row with `Absent` on every other date.
    /// Returns `false` when the cell was already `Present`.
    pub fn mark_present(&mut self, identity: &Identity, date: NaiveDate) -> bool {
        self.ensure_date_column(date);
        let Some(col) = self.dates.iter().position(|d| *d == date) else {
            return false;
        };

        match self.index.get(identity) {
            Some(&row) => {
                let cell = &mut self.rows[row].cells[col];
                if *cell == Status::Present {
                    return false;
                }
                *cell = Status::Present;
            }
            None => {
                let mut cells = vec![Status::Absent; self.dates.len()];
                cells[col] = Status::Present;
                self.index.insert(identity.clone(), self.rows.len());
                self.rows.push(Row {
                    identity: identity.clone(),
                    cells,
                });
            }
        }
        true
    }

    /// Persist atomically: write a sibling temp file, sync it, rename it over `path`.
    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        let fail = |source| PersistenceError {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(fail)?;
        }

        let bytes = self.to_csv_bytes().map_err(fail)?;
        let tmp = temp_path(path);
        let written = write_synced(&tmp, &bytes).and_then(|()| std::fs::rename(&tmp, path));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(fail(e));
        }

        tracing::debug!(path = %path.display(), people = self.rows.len(), "ledger saved");
        Ok(())
    }

    /// Serialized artifact, byte-for-byte what [`save`](Self::save) writes.
    pub fn to_csv_bytes(&self) -> std::io::Result<Vec<u8>> {
        let terminator = if self.crlf {
            csv::Terminator::CRLF
        } else {
            csv::Terminator::Any(b'\n')
        };
        let mut writer = csv::WriterBuilder::new()
            .terminator(terminator)
            .from_writer(Vec::new());

        writer.write_record(self.header())?;
        for row in &self.rows {
            writer.write_record(
                std::iter::once(row.identity.as_str()).chain(row.cells.iter().map(|s| s.as_str())),
            )?;
        }
        writer.into_inner().map_err(|e| e.into_error())
    }

    pub fn to_csv_string(&self) -> std::io::Result<String> {
        let bytes = self.to_csv_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Header row: `Name` followed by the date labels.
    pub fn header(&self) -> Vec<String> {
        std::iter::once(NAME_COLUMN.to_string())
            .chain(self.dates.iter().map(|d| d.format(DATE_FORMAT).to_string()))
            .collect()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.rows.iter().map(|r| &r.identity)
    }

    /// Rows in ledger order, one status per date column.
    pub fn rows(&self) -> impl Iterator<Item = (&Identity, &[Status])> {
        self.rows.iter().map(|r| (&r.identity, r.cells.as_slice()))
    }

    pub fn status(&self, identity: &Identity, date: NaiveDate) -> Option<Status> {
        let col = self.dates.iter().position(|d| *d == date)?;
        let row = *self.index.get(identity)?;
        Some(self.rows[row].cells[col])
    }

    /// Identities marked present on `date`, in row order.
    pub fn present_on(&self, date: NaiveDate) -> Vec<&Identity> {
        let Some(col) = self.dates.iter().position(|d| *d == date) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter(|r| r.cells[col] == Status::Present)
            .map(|r| &r.identity)
            .collect()
    }

    pub fn days_present(&self, identity: &Identity) -> usize {
        self.index
            .get(identity)
            .map(|&row| {
                self.rows[row]
                    .cells
                    .iter()
                    .filter(|s| **s == Status::Present)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of identities (rows).
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Move a corrupt artifact aside so an empty ledger can take its place
/// without destroying the recorded history. Returns the new location.
pub fn quarantine(path: &Path) -> std::io::Result<PathBuf> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attendance.csv".to_string());
    let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S");
    let mut target = path.with_file_name(format!("{name}.corrupt-{stamp}"));
    // Never replace an earlier quarantined artifact from the same second.
    let mut attempt = 1;
    while target.exists() {
        target = path.with_file_name(format!("{name}.corrupt-{stamp}-{attempt}"));
        attempt += 1;
    }
    std::fs::rename(path, &target)?;
    tracing::warn!(
        from = %path.display(),
        to = %target.display(),
        "quarantined corrupt ledger"
    );
    Ok(target)
}

fn parse_date_label(label: &str) -> Option<NaiveDate> {
    let date = NaiveDate::parse_from_str(label, DATE_FORMAT).ok()?;
    // Only canonical labels survive a load/save round trip unchanged.
    (date.format(DATE_FORMAT).to_string() == label).then_some(date)
}

fn line_of(record: &csv::StringRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or(0)
}

fn csv_corruption(err: csv::Error) -> CorruptLedgerError {
    let line = err.position().map(|p| p.line()).unwrap_or(0);
    CorruptLedgerError {
        line,
        reason: err.to_string(),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attendance.csv".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
