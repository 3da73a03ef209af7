//! Working-directory snapshots and the before/after diff used to detect
//! files produced by a run.
//!
//! Detection is best effort: the runtime offers no atomic change
//! notification, so a file written by something other than the run between
//! the two listings is indistinguishable from run output.

use std::collections::BTreeMap;

use regex::Regex;

use crate::language::shell_quote;

/// Size and modification time of one file, as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    /// Seconds since the epoch, kept verbatim so comparisons are exact.
    pub mtime: String,
}

/// Regular files directly inside a directory, keyed by name.
pub type DirSnapshot = BTreeMap<String, FileStamp>;

/// Shell command listing `workdir` as `name|size|mtime` lines.
pub fn listing_command(workdir: &str) -> String {
    format!(
        "find {} -maxdepth 1 -type f -printf '%f|%s|%T@\\n'",
        shell_quote(workdir)
    )
}

/// Parse the output of [`listing_command`]. Malformed lines are ignored.
pub fn parse_listing(output: &str) -> DirSnapshot {
    let mut snapshot = DirSnapshot::new();
    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        // split from the right so names containing '|' survive
        let mut parts = line.rsplitn(3, '|');
        let (Some(mtime), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(size) = size.parse() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        snapshot.insert(
            name.to_string(),
            FileStamp {
                size,
                mtime: mtime.to_string(),
            },
        );
    }
    snapshot
}

/// Names matching this filter are engine scratch files, never user output.
#[derive(Debug, Clone)]
pub struct ScratchFilter {
    pattern: Regex,
}

impl ScratchFilter {
    pub const fn new(pattern: Regex) -> Self {
        Self { pattern }
    }

    pub fn is_scratch(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }
}

/// Files that are new in `after` or whose size/mtime changed, minus scratch
/// files. Returned in name order.
pub fn changed_files(before: &DirSnapshot, after: &DirSnapshot, scratch: &ScratchFilter) -> Vec<String> {
    after
        .iter()
        .filter(|(name, stamp)| !scratch.is_scratch(name) && before.get(*name) != Some(*stamp))
        .map(|(name, _)| name.clone())
        .collect()
}
