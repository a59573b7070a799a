//! Replication position ordering and the promotability rules built on it.
//!
//! A position is a binlog file name plus an offset into that file. File
//! names are ordered by base name, then by the suffix after the last '.':
//! numeric suffixes compare as numbers (`mysql-bin.000009` <
//! `mysql-bin.000010`) and sort before non-numeric ones. A node whose replication status cannot be read has an
//! [`ReplicationView::Unknown`] view, which is never comparable and never
//! promotable.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::messages::RetCode;
use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GtidPosition {
    pub log_file: String,
    pub offset: u64,
}

impl GtidPosition {
    pub fn new(log_file: impl Into<String>, offset: u64) -> Self {
        Self {
            log_file: log_file.into(),
            offset,
        }
    }
}

impl fmt::Display for GtidPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.offset)
    }
}

impl Ord for GtidPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_log_files(&self.log_file, &other.log_file).then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for GtidPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort key of a binlog file name split at its last '.'.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Suffix<'a> {
    Missing,
    // Leading zeros stripped; fewer digits is the smaller number.
    Sequence { digits: usize, value: &'a str },
    Named(&'a str),
}

fn log_file_key(log_file: &str) -> (&str, Suffix<'_>) {
    match log_file.rsplit_once('.') {
        Some((base, suffix)) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
            let value = suffix.trim_start_matches('0');
            (
                base,
                Suffix::Sequence {
                    digits: value.len(),
                    value,
                },
            )
        }
        Some((base, suffix)) => (base, Suffix::Named(suffix)),
        None => (log_file, Suffix::Missing),
    }
}

fn compare_log_files(a: &str, b: &str) -> Ordering {
    log_file_key(a).cmp(&log_file_key(b)).then_with(|| a.cmp(b))
}

/// What a node knows about its own replication position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplicationView {
    Known(GtidPosition),
    Unknown,
}

impl ReplicationView {
    pub fn is_known(&self) -> bool {
        matches!(self, ReplicationView::Known(_))
    }

    pub fn position(&self) -> Option<&GtidPosition> {
        match self {
            ReplicationView::Known(position) => Some(position),
            ReplicationView::Unknown => None,
        }
    }
}

impl From<GtidPosition> for ReplicationView {
    fn from(position: GtidPosition) -> Self {
        ReplicationView::Known(position)
    }
}

impl fmt::Display for ReplicationView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationView::Known(position) => position.fmt(f),
            ReplicationView::Unknown => f.write_str("unknown"),
        }
    }
}

/// Result of ordering `a` against `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtidOrdering {
    Ahead,
    Behind,
    Equal,
    /// At least one side is unknown; never safe to promote on.
    Unknown,
}

pub fn compare(a: &ReplicationView, b: &ReplicationView) -> GtidOrdering {
    match (a, b) {
        (ReplicationView::Known(a), ReplicationView::Known(b)) => match a.cmp(b) {
            Ordering::Greater => GtidOrdering::Ahead,
            Ordering::Less => GtidOrdering::Behind,
            Ordering::Equal => GtidOrdering::Equal,
        },
        _ => GtidOrdering::Unknown,
    }
}

/// Decides whether a voter holding `local` may vote for a candidate
/// advertising `candidate`. The error is the denial code to send back.
pub fn check_vote(candidate: &ReplicationView, local: &ReplicationView) -> Result<(), RetCode> {
    if !candidate.is_known() {
        return Err(RetCode::Unpromotable);
    }
    match compare(candidate, local) {
        GtidOrdering::Ahead | GtidOrdering::Equal => Ok(()),
        GtidOrdering::Behind => Err(RetCode::CandidateBehind),
        // The voter cannot tell whether the candidate lags.
        GtidOrdering::Unknown => Err(RetCode::ReplicationUnknown),
    }
}

/// Decides whether `target` may be promoted by an administrative transfer.
///
/// The target must be known and at least tied with every peer whose
/// position is known. Peers that are unknown or unreachable rank lowest.
/// The error carries a human readable reason.
pub fn check_transfer(target: &ReplicationView, peers: &[(NodeId, ReplicationView)]) -> Result<(), String> {
    let Some(position) = target.position() else {
        return Err("replication position unknown".to_string());
    };
    for (peer, view) in peers {
        if compare(target, view) == GtidOrdering::Behind {
            return Err(format!(
                "replication position {} is behind {} at {}",
                position, peer, view
            ));
        }
    }
    Ok(())
}
