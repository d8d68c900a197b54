//! Chip file identifiers, file sets and completeness checks.
//!
//! A file identifier is transmitted at most once per session. The
//! [`FileTracker`] remembers what has been sent to and received from the
//! server so later phases never retransmit.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Identifier of a file read from the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileId {
    /// EF.COM, the data group directory.
    Com,
    /// EF.SOD, the signed hash manifest used for passive authentication.
    Sod,
    /// Data group 1..=16.
    Dg(u8),
    /// EF.CardAccess (PACE parameters).
    CardAccess,
    /// EF.CardSecurity.
    CardSecurity,
}

impl FileId {
    /// Biographic data (MRZ).
    pub const DG1: FileId = FileId::Dg(1);
    /// Encoded facial image.
    pub const DG2: FileId = FileId::Dg(2);
    /// Chip authentication public key. Its absence selects the no-CA path.
    pub const DG14: FileId = FileId::Dg(14);
    /// Active authentication public key.
    pub const DG15: FileId = FileId::Dg(15);

    /// Files that every complete read must contain.
    pub const MANDATORY: [FileId; 3] = [FileId::DG1, FileId::DG2, FileId::Sod];

    /// The file carrying the chip's security key.
    pub const SECURITY_KEY: FileId = FileId::DG14;

    /// Wire name of this file.
    pub fn name(self) -> String {
        match self {
            Self::Com => "com".to_string(),
            Self::Sod => "sod".to_string(),
            Self::Dg(n) => format!("dg{}", n),
            Self::CardAccess => "cardAccess".to_string(),
            Self::CardSecurity => "cardSecurity".to_string(),
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for FileId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "com" => Ok(Self::Com),
            "sod" => Ok(Self::Sod),
            "cardAccess" => Ok(Self::CardAccess),
            "cardSecurity" => Ok(Self::CardSecurity),
            other => other
                .strip_prefix("dg")
                .and_then(|n| n.parse::<u8>().ok())
                .filter(|n| (1..=16).contains(n))
                .map(Self::Dg)
                .ok_or_else(|| ProtocolError::UnknownFile(other.to_string())),
        }
    }
}

/// Files read from the chip, keyed by identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet(BTreeMap<FileId, Vec<u8>>);

impl FileSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file, replacing any previous content.
    pub fn insert(&mut self, id: FileId, data: Vec<u8>) {
        self.0.insert(id, data);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, id: FileId, data: impl Into<Vec<u8>>) -> Self {
        self.insert(id, data.into());
        self
    }

    /// Look up a file.
    pub fn get(&self, id: FileId) -> Option<&[u8]> {
        self.0.get(&id).map(Vec::as_slice)
    }

    /// Whether the file is present.
    pub fn contains(&self, id: FileId) -> bool {
        self.0.contains_key(&id)
    }

    /// Remove a file.
    pub fn remove(&mut self, id: FileId) -> Option<Vec<u8>> {
        self.0.remove(&id)
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (FileId, &[u8])> {
        self.0.iter().map(|(id, data)| (*id, data.as_slice()))
    }

    /// Whether the chip exposed its security-key file.
    pub fn has_security_key(&self) -> bool {
        self.contains(FileId::SECURITY_KEY)
    }
}

impl FromIterator<(FileId, Vec<u8>)> for FileSet {
    fn from_iter<I: IntoIterator<Item = (FileId, Vec<u8>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for FileSet {
    type Item = (FileId, Vec<u8>);
    type IntoIter = std::collections::btree_map::IntoIter<FileId, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Tracks which files already crossed the wire in either direction.
#[derive(Debug, Default)]
pub struct FileTracker {
    sent: HashSet<FileId>,
    received: HashSet<FileId>,
}

impl FileTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the file was already sent or received.
    pub fn is_transferred(&self, id: FileId) -> bool {
        self.sent.contains(&id) || self.received.contains(&id)
    }

    /// Record an outbound file.
    pub fn mark_sent(&mut self, id: FileId) {
        self.sent.insert(id);
    }

    /// Record an inbound file.
    pub fn mark_received(&mut self, id: FileId) {
        self.received.insert(id);
    }

    /// Whether the file was sent.
    pub fn was_sent(&self, id: FileId) -> bool {
        self.sent.contains(&id)
    }

    /// Forget everything (new session).
    pub fn clear(&mut self) {
        self.sent.clear();
        self.received.clear();
    }
}

/// Check that a read produced every mandatory and every requested file.
///
/// Missing identifiers are reported mandatory-first, then in request order,
/// each at most once.
pub fn validate_required_files(files: &FileSet, requested: &[FileId]) -> Result<(), ProtocolError> {
    let mut missing: Vec<FileId> = Vec::new();
    for id in FileId::MANDATORY.iter().chain(requested) {
        if !files.contains(*id) && !missing.contains(id) {
            missing.push(*id);
        }
    }

    if missing.is_empty() {
        return Ok(());
    }

    let names: Vec<String> = missing.iter().map(|id| id.name()).collect();
    Err(ProtocolError::IncompleteRead {
        reason: format!("chip read ended without {}", names.join(", ")),
        missing,
    })
}
