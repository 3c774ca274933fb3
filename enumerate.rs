//! Object id discovery over a storage root.
//!
//! Used by integrity sweeps and orphan detection. Nothing is decrypted here:
//! a name counts as an object if its path, with separators and an optional
//! `.meta` suffix removed, is exactly 64 hex characters.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::metadata::META_SUFFIX;
use crate::types::Id;
use crate::Result;

/// Result of a storage scan
#[derive(Debug, Default)]
pub struct IdScan {
    pub ids: HashSet<Id>,
    /// Entries that did not parse as an id; skipped, not fatal
    pub malformed: Vec<PathBuf>,
}

/// Scan `root` and collect every well-formed object id.
///
/// A missing root yields an empty scan. Malformed names and unreadable
/// subdirectories are logged and skipped.
pub fn scan_ids(root: &Path) -> Result<IdScan> {
    let mut scan = IdScan::default();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(root = %root.display(), "storage root missing, nothing to scan");
            return Ok(scan);
        }
        Err(e) => return Err(e.into()),
    };
    scan_entries(entries, String::new(), &mut scan);
    debug!(
        root = %root.display(),
        ids = scan.ids.len(),
        malformed = scan.malformed.len(),
        "storage scan complete"
    );
    Ok(scan)
}

/// The set of object ids under `root`
pub fn enumerate_ids(root: &Path) -> Result<HashSet<Id>> {
    Ok(scan_ids(root)?.ids)
}

fn scan_entries(entries: fs::ReadDir, prefix: String, scan: &mut IdScan) {
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(_) => {
                warn!(path = %path.display(), "skipping non UTF-8 entry");
                scan.malformed.push(path);
                continue;
            }
        };
        // Control files such as the key file
        if name.starts_with('.') {
            continue;
        }

        let is_dir = match entry.file_type() {
            Ok(t) => t.is_dir(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping entry with unknown type");
                continue;
            }
        };

        if is_dir {
            match fs::read_dir(&path) {
                Ok(sub) => scan_entries(sub, format!("{prefix}{name}"), scan),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable directory"),
            }
            continue;
        }

        let stem = name.strip_suffix(META_SUFFIX).unwrap_or(&name);
        match format!("{prefix}{stem}").parse::<Id>() {
            Ok(id) => {
                scan.ids.insert(id);
            }
            Err(_) => {
                warn!(path = %path.display(), "skipping malformed object name");
                scan.malformed.push(path);
            }
        }
    }
}
