use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

use crate::PeerId;

/// Largest peer id that fits the 4-digit ASCII field of the handshake.
pub const MAX_PEER_ID: u32 = 9999;

pub const COMMON_FILE_NAME: &str = "Common.cfg";
pub const ROSTER_FILE_NAME: &str = "PeerInfo.cfg";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("missing line for key {key}")]
    MissingKey { key: &'static str },
    #[error("expected key {expected} on line {line}, found {found:?}")]
    UnexpectedKey {
        line: usize,
        expected: &'static str,
        found: String,
    },
    #[error("invalid value {value:?} for {key} on line {line}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    #[error("malformed roster line {line}: {text:?}")]
    MalformedRosterLine { line: usize, text: String },
    #[error("duplicate peer id {0} in roster")]
    DuplicatePeer(PeerId),
    #[error("peer id {0} is outside the 4 digit handshake range 1..={MAX_PEER_ID}")]
    PeerIdOutOfRange(u32),
    #[error("peer {0} is not present in the roster")]
    UnknownPeer(PeerId),
}

/// Common parameters, fixed after startup and shared by every peer in the
/// cohort. Parsed from the ordered `Key value` lines of `Common.cfg`.
#[derive(Debug, Clone)]
pub struct Common {
    /// Preferred-neighbor count `k`.
    pub preferred_neighbors: usize,
    /// Preferred-neighbors re-selection interval `p`.
    pub unchoking_interval: Duration,
    /// Optimistic-unchoke rotation interval `m`.
    pub optimistic_unchoking_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u32,
}

impl Common {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut lines = ConfigLines::new(input);
        let preferred_neighbors = lines.value("NumberOfPreferredNeighbors")?;
        let unchoking_interval = lines.value("UnchokingInterval")?;
        let optimistic_unchoking_interval = lines.value("OptimisticUnchokingInterval")?;
        let file_name: String = lines.value("FileName")?;
        let file_size = lines.value("FileSize")?;
        let piece_size: u32 = lines.value("PieceSize")?;
        if piece_size == 0 {
            return Err(ConfigError::InvalidValue {
                line: 6,
                key: "PieceSize".to_owned(),
                value: "0".to_owned(),
            });
        }
        Ok(Self {
            preferred_neighbors,
            unchoking_interval: Duration::from_secs(unchoking_interval),
            optimistic_unchoking_interval: Duration::from_secs(optimistic_unchoking_interval),
            file_name,
            file_size,
            piece_size,
        })
    }

    /// Total pieces `T`, the ceiling of file size over piece size.
    pub fn total_pieces(&self) -> u32 {
        ((self.file_size + u64::from(self.piece_size) - 1) / u64::from(self.piece_size)) as u32
    }

    /// Length of piece `index`; the final piece may be shorter.
    pub fn piece_length(&self, index: u32) -> u32 {
        let total = self.total_pieces();
        debug_assert!(index < total);
        if index + 1 == total {
            (self.file_size - u64::from(total - 1) * u64::from(self.piece_size)) as u32
        } else {
            self.piece_size
        }
    }
}

struct ConfigLines<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
}

impl<'a> ConfigLines<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            lines: input.lines().enumerate(),
        }
    }

    fn value<T: std::str::FromStr>(&mut self, key: &'static str) -> Result<T, ConfigError> {
        let (index, line) = self
            .lines
            .find(|(_, line)| !line.trim().is_empty())
            .ok_or(ConfigError::MissingKey { key })?;
        let line_no = index + 1;
        let mut fields = line.split_whitespace();
        let found = fields.next().unwrap_or_default();
        if found != key {
            return Err(ConfigError::UnexpectedKey {
                line: line_no,
                expected: key,
                found: found.to_owned(),
            });
        }
        let value = fields.next().ok_or_else(|| ConfigError::InvalidValue {
            line: line_no,
            key: key.to_owned(),
            value: String::new(),
        })?;
        value.parse().map_err(|_| ConfigError::InvalidValue {
            line: line_no,
            key: key.to_owned(),
            value: value.to_owned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

/// The static peer roster. Line order defines roster order, which decides
/// which side of every pair dials and which listens.
#[derive(Debug, Clone)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn new(entries: Vec<RosterEntry>) -> Result<Self, ConfigError> {
        for (i, entry) in entries.iter().enumerate() {
            let raw = u32::from(entry.id);
            if raw == 0 || raw > MAX_PEER_ID {
                return Err(ConfigError::PeerIdOutOfRange(raw));
            }
            if entries[..i].iter().any(|e| e.id == entry.id) {
                return Err(ConfigError::DuplicatePeer(entry.id));
            }
        }
        Ok(Self { entries })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        for (index, line) in input.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let malformed = || ConfigError::MalformedRosterLine {
                line: index + 1,
                text: line.to_owned(),
            };
            let mut fields = line.split_whitespace();
            let id: u32 = fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(malformed)?;
            let host = fields.next().ok_or_else(malformed)?.to_owned();
            let port: u16 = fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(malformed)?;
            let has_file = match fields.next() {
                Some("0") => false,
                Some("1") => true,
                _ => return Err(malformed()),
            };
            entries.push(RosterEntry {
                id: PeerId::new(id),
                host,
                port,
                has_file,
            });
        }
        Self::new(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RosterEntry> {
        self.entries.iter()
    }

    pub fn get(&self, id: PeerId) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn position(&self, id: PeerId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Roster entries that precede `id` in roster order; the peers `id` dials.
    pub fn preceding(&self, id: PeerId) -> impl Iterator<Item = &RosterEntry> {
        self.entries
            .iter()
            .take(self.position(id).unwrap_or(self.entries.len()))
    }

    /// Does `other` come after `local` in roster order? Inbound connections
    /// are only expected from such peers.
    pub fn follows(&self, local: PeerId, other: PeerId) -> bool {
        match (self.position(local), self.position(other)) {
            (Some(l), Some(o)) => o > l,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const COMMON: &str = "\
NumberOfPreferredNeighbors 2
UnchokingInterval 5
OptimisticUnchokingInterval 15
FileName thefile
FileSize 10000232
PieceSize 32768
";

    const ROSTER: &str = "\
1001 lin114-00.cise.ufl.edu 6008 1
1002 lin114-01.cise.ufl.edu 6008 0
1003 lin114-02.cise.ufl.edu 6008 0
";

    #[test]
    fn parse_common() {
        let common = Common::parse(COMMON).unwrap();
        assert_eq!(common.preferred_neighbors, 2);
        assert_eq!(common.unchoking_interval, Duration::from_secs(5));
        assert_eq!(common.optimistic_unchoking_interval, Duration::from_secs(15));
        assert_eq!(common.file_name, "thefile");
        assert_eq!(common.file_size, 10000232);
        assert_eq!(common.piece_size, 32768);
        assert_eq!(common.total_pieces(), 306);
        assert_eq!(common.piece_length(0), 32768);
        assert_eq!(common.piece_length(305), 10000232 - 305 * 32768);
    }

    #[test]
    fn parse_common_rejects_reordered_keys() {
        let shuffled = COMMON.replace("NumberOfPreferredNeighbors", "UnchokingInterval");
        assert!(matches!(
            Common::parse(&shuffled),
            Err(ConfigError::UnexpectedKey { .. })
        ));
    }

    #[test]
    fn parse_common_rejects_bad_integer() {
        let bad = COMMON.replace("10000232", "ten");
        assert!(matches!(
            Common::parse(&bad),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn parse_roster() {
        let roster = Roster::parse(ROSTER).unwrap();
        assert_eq!(roster.len(), 3);
        let first = roster.get(PeerId::new(1001)).unwrap();
        assert!(first.has_file);
        assert_eq!(first.port, 6008);
        assert!(!roster.get(PeerId::new(1002)).unwrap().has_file);
        assert!(roster.get(PeerId::new(9)).is_none());
    }

    #[test]
    fn roster_order_decides_dial_direction() {
        let roster = Roster::parse(ROSTER).unwrap();
        let dials: Vec<_> = roster
            .preceding(PeerId::new(1003))
            .map(|e| u32::from(e.id))
            .collect();
        assert_eq!(dials, vec![1001, 1002]);
        assert!(roster.follows(PeerId::new(1001), PeerId::new(1002)));
        assert!(!roster.follows(PeerId::new(1002), PeerId::new(1001)));
        assert!(!roster.follows(PeerId::new(1002), PeerId::new(1002)));
    }

    #[test]
    fn roster_rejects_duplicates_and_wide_ids() {
        let dup = format!("{ROSTER}1002 localhost 7000 0\n");
        assert!(matches!(
            Roster::parse(&dup),
            Err(ConfigError::DuplicatePeer(_))
        ));
        assert!(matches!(
            Roster::parse("10001 localhost 7000 0\n"),
            Err(ConfigError::PeerIdOutOfRange(10001))
        ));
        assert!(matches!(
            Roster::parse("1001 localhost 7000 2\n"),
            Err(ConfigError::MalformedRosterLine { .. })
        ));
    }
}
