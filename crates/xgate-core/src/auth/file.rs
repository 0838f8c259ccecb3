//! Credential storage for the `file` and `multifile` backends.
//!
//! Both backends re-read their file on every attempt, so credentials can be
//! rotated without restarting the server.  A missing, unreadable, or
//! unconfigured file is configuration-equivalent to "no credential can ever
//! match": verification degrades to `PasswordRequired`, never a crash.

use std::fs;
use std::path::PathBuf;

use tracing::warn;

/// Single shared secret stored in a flat file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAuth {
    /// Path to the secret file; `None` when the backend was selected without
    /// a `filename` option (always `PasswordRequired`).
    pub path: Option<PathBuf>,
}

impl FileAuth {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Reads the shared secret, trimming the trailing newline.
    pub fn load_secret(&self) -> Option<String> {
        let path = self.path.as_ref()?;
        match fs::read_to_string(path) {
            Ok(contents) => Some(contents.trim_end_matches(['\r', '\n']).to_string()),
            Err(e) => {
                warn!("cannot read password file {}: {e}", path.display());
                None
            }
        }
    }
}

/// One record of a `multifile` credential table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiFileRecord {
    pub username: String,
    pub password: String,
    pub uid: u32,
    pub gid: u32,
    /// Displays this user may connect to; empty means unrestricted.
    pub displays: Vec<String>,
}

impl MultiFileRecord {
    /// Whether this record admits connections to `display`.
    pub fn allows_display(&self, display: &str) -> bool {
        self.displays.is_empty() || self.displays.iter().any(|d| d == display)
    }
}

/// Username-indexed credential table stored one record per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiFileAuth {
    /// Path to the table; `None` when unconfigured.
    pub path: Option<PathBuf>,
}

impl MultiFileAuth {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Looks up the record for `username`, re-reading the table.
    pub fn lookup(&self, username: &str) -> Option<MultiFileRecord> {
        let path = self.path.as_ref()?;
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("cannot read multifile table {}: {e}", path.display());
                return None;
            }
        };
        parse_records(&contents)
            .into_iter()
            .find(|r| r.username == username)
    }
}

/// Parses a multifile table.
///
/// Record format, pipe-delimited:
///
/// ```text
/// username|password|uid|gid|display-list||
/// ```
///
/// `display-list` is comma-separated and empty for "all displays".  Fields
/// after the display list are reserved and tolerated if empty.  Blank lines
/// and `#` comments are skipped; malformed lines are skipped with a warning
/// rather than failing the whole table.
pub fn parse_records(contents: &str) -> Vec<MultiFileRecord> {
    let mut records = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 4 {
            warn!("multifile line {} has {} fields, need at least 4", lineno + 1, fields.len());
            continue;
        }
        let (uid, gid) = match (fields[2].parse(), fields[3].parse()) {
            (Ok(uid), Ok(gid)) => (uid, gid),
            _ => {
                warn!("multifile line {} has non-numeric uid/gid", lineno + 1);
                continue;
            }
        };
        let displays = fields
            .get(4)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        records.push(MultiFileRecord {
            username: fields[0].to_string(),
            password: fields[1].to_string(),
            uid,
            gid,
            displays,
        });
    }
    records
}

// ── Tests ─────────────────────────────────────────────────────────────────────
