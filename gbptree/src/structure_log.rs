//! Append-only log of structural tree changes.
//!
//! The log is a diagnostic trail: it is never replayed into the tree. Each
//! open appends under a fresh random session id.
//!
//! # Record Format
//!
//! ```text
//! +----------+--------------------------------------------------+
//! | 0-3      | record_length (4 bytes, includes header+payload) |
//! | 4        | record_type (1 byte)                             |
//! | 5-12     | session_id (8 bytes)                             |
//! | 13-20    | timestamp_millis (8 bytes)                       |
//! | 21-28    | generation (8 bytes)                             |
//! | 29-N     | payload: page ids / generations (8 bytes each)   |
//! | N-N+3    | CRC32 checksum (4 bytes)                         |
//! +----------+--------------------------------------------------+
//! ```

#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::page::PageId;

const RECORD_HEADER_SIZE: usize = 29;
const CHECKSUM_SIZE: usize = 4;

/// Structural event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StructureRecordType {
    Split = 0x01,
    Merge = 0x02,
    CreateSuccessor = 0x03,
    AddToFreelist = 0x04,
    GrowTree = 0x05,
    ShrinkTree = 0x06,
    Checkpoint = 0x07,
}

impl TryFrom<u8> for StructureRecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Split),
            0x02 => Ok(Self::Merge),
            0x03 => Ok(Self::CreateSuccessor),
            0x04 => Ok(Self::AddToFreelist),
            0x05 => Ok(Self::GrowTree),
            0x06 => Ok(Self::ShrinkTree),
            0x07 => Ok(Self::Checkpoint),
            _ => Err(value),
        }
    }
}

/// One structural change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureEvent {
    Split {
        parent_id: PageId,
        child_id: PageId,
        created_child_id: PageId,
    },
    Merge {
        parent_id: PageId,
        child_id: PageId,
        deleted_child_id: PageId,
    },
    CreateSuccessor {
        parent_id: PageId,
        old_id: PageId,
        new_id: PageId,
    },
    AddToFreelist {
        id: PageId,
    },
    GrowTree {
        created_root_id: PageId,
    },
    ShrinkTree {
        deleted_root_id: PageId,
    },
    Checkpoint {
        previous_stable: u64,
        new_stable: u64,
        new_unstable: u64,
    },
}

impl StructureEvent {
    #[must_use]
    pub const fn record_type(&self) -> StructureRecordType {
        match self {
            Self::Split { .. } => StructureRecordType::Split,
            Self::Merge { .. } => StructureRecordType::Merge,
            Self::CreateSuccessor { .. } => StructureRecordType::CreateSuccessor,
            Self::AddToFreelist { .. } => StructureRecordType::AddToFreelist,
            Self::GrowTree { .. } => StructureRecordType::GrowTree,
            Self::ShrinkTree { .. } => StructureRecordType::ShrinkTree,
            Self::Checkpoint { .. } => StructureRecordType::Checkpoint,
        }
    }

    fn payload(&self) -> Vec<u64> {
        match *self {
            Self::Split {
                parent_id,
                child_id,
                created_child_id,
            } => vec![parent_id, child_id, created_child_id],
            Self::Merge {
                parent_id,
                child_id,
                deleted_child_id,
            } => vec![parent_id, child_id, deleted_child_id],
            Self::CreateSuccessor {
                parent_id,
                old_id,
                new_id,
            } => vec![parent_id, old_id, new_id],
            Self::AddToFreelist { id } => vec![id],
            Self::GrowTree { created_root_id } => vec![created_root_id],
            Self::ShrinkTree { deleted_root_id } => vec![deleted_root_id],
            Self::Checkpoint {
                previous_stable,
                new_stable,
                new_unstable,
            } => vec![previous_stable, new_stable, new_unstable],
        }
    }

    fn from_payload(record_type: StructureRecordType, payload: &[u64]) -> Option<Self> {
        let event = match (record_type, payload) {
            (StructureRecordType::Split, &[parent_id, child_id, created_child_id]) => Self::Split {
                parent_id,
                child_id,
                created_child_id,
            },
            (StructureRecordType::Merge, &[parent_id, child_id, deleted_child_id]) => Self::Merge {
                parent_id,
                child_id,
                deleted_child_id,
            },
            (StructureRecordType::CreateSuccessor, &[parent_id, old_id, new_id]) => {
                Self::CreateSuccessor {
                    parent_id,
                    old_id,
                    new_id,
                }
            }
            (StructureRecordType::AddToFreelist, &[id]) => Self::AddToFreelist { id },
            (StructureRecordType::GrowTree, &[created_root_id]) => {
                Self::GrowTree { created_root_id }
            }
            (StructureRecordType::ShrinkTree, &[deleted_root_id]) => {
                Self::ShrinkTree { deleted_root_id }
            }
            (StructureRecordType::Checkpoint, &[previous_stable, new_stable, new_unstable]) => {
                Self::Checkpoint {
                    previous_stable,
                    new_stable,
                    new_unstable,
                }
            }
            _ => return None,
        };
        Some(event)
    }
}

/// Receives replayed events. One method per event type.
#[allow(unused_variables)]
pub trait StructureEvents {
    fn split(
        &mut self,
        session_id: u64,
        timestamp: u64,
        generation: u64,
        parent_id: PageId,
        child_id: PageId,
        created_child_id: PageId,
    ) {
    }

    fn merge(
        &mut self,
        session_id: u64,
        timestamp: u64,
        generation: u64,
        parent_id: PageId,
        child_id: PageId,
        deleted_child_id: PageId,
    ) {
    }

    fn create_successor(
        &mut self,
        session_id: u64,
        timestamp: u64,
        generation: u64,
        parent_id: PageId,
        old_id: PageId,
        new_id: PageId,
    ) {
    }

    fn add_to_freelist(&mut self, session_id: u64, timestamp: u64, generation: u64, id: PageId) {}

    fn grow_tree(
        &mut self,
        session_id: u64,
        timestamp: u64,
        generation: u64,
        created_root_id: PageId,
    ) {
    }

    fn shrink_tree(
        &mut self,
        session_id: u64,
        timestamp: u64,
        generation: u64,
        deleted_root_id: PageId,
    ) {
    }

    fn checkpoint(
        &mut self,
        session_id: u64,
        timestamp: u64,
        previous_stable: u64,
        new_stable: u64,
        new_unstable: u64,
    ) {
    }
}

/// Writer side of the structure log.
#[derive(Debug)]
pub struct StructureWriteLog {
    session_id: u64,
    out: Mutex<BufWriter<File>>,
}

impl StructureWriteLog {
    /// Open `path` for appending under a new random session id.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            session_id: rand::random(),
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    #[must_use]
    pub const fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Append an event tagged with `generation`.
    pub fn log(&self, generation: u64, event: StructureEvent) -> std::io::Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64);
        let bytes = encode(self.session_id, timestamp, generation, &event);
        self.out.lock().write_all(&bytes)
    }

    /// Push buffered records to the file.
    pub fn flush(&self) -> std::io::Result<()> {
        let mut out = self.out.lock();
        out.flush()?;
        out.get_ref().sync_data()
    }

    /// Replay every complete record of the log at `path`. Reading stops at
    /// the first torn or corrupt record. Returns the number of events read.
    pub fn read(path: &Path, events: &mut impl StructureEvents) -> std::io::Result<usize> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        let mut offset = 0;
        let mut count = 0;
        while let Some((record, length)) = decode(&bytes[offset..]) {
            dispatch(events, &record);
            offset += length;
            count += 1;
        }
        Ok(count)
    }
}

#[derive(Debug)]
struct Record {
    session_id: u64,
    timestamp: u64,
    generation: u64,
    event: StructureEvent,
}

fn encode(session_id: u64, timestamp: u64, generation: u64, event: &StructureEvent) -> Vec<u8> {
    let payload = event.payload();
    let length = RECORD_HEADER_SIZE + payload.len() * 8 + CHECKSUM_SIZE;
    let mut bytes = Vec::with_capacity(length);
    bytes.extend_from_slice(&(length as u32).to_le_bytes());
    bytes.push(event.record_type() as u8);
    bytes.extend_from_slice(&session_id.to_le_bytes());
    bytes.extend_from_slice(&timestamp.to_le_bytes());
    bytes.extend_from_slice(&generation.to_le_bytes());
    for value in payload {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    let checksum = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn decode(bytes: &[u8]) -> Option<(Record, usize)> {
    if bytes.len() < 4 {
        return None;
    }
    let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if length < RECORD_HEADER_SIZE + CHECKSUM_SIZE || length > bytes.len() {
        return None;
    }
    let body = &bytes[..length - CHECKSUM_SIZE];
    let stored = u32::from_le_bytes([
        bytes[length - 4],
        bytes[length - 3],
        bytes[length - 2],
        bytes[length - 1],
    ]);
    if crc32fast::hash(body) != stored {
        return None;
    }

    let record_type = StructureRecordType::try_from(body[4]).ok()?;
    let payload_bytes = &body[RECORD_HEADER_SIZE..];
    if payload_bytes.len() % 8 != 0 {
        return None;
    }
    let payload: Vec<u64> = (0..payload_bytes.len() / 8)
        .map(|i| read_u64(payload_bytes, i * 8))
        .collect();
    let record = Record {
        session_id: read_u64(body, 5),
        timestamp: read_u64(body, 13),
        generation: read_u64(body, 21),
        event: StructureEvent::from_payload(record_type, &payload)?,
    };
    Some((record, length))
}

fn dispatch(events: &mut impl StructureEvents, record: &Record) {
    let Record {
        session_id: s,
        timestamp: t,
        generation: g,
        event,
    } = *record;
    match event {
        StructureEvent::Split {
            parent_id,
            child_id,
            created_child_id,
        } => events.split(s, t, g, parent_id, child_id, created_child_id),
        StructureEvent::Merge {
            parent_id,
            child_id,
            deleted_child_id,
        } => events.merge(s, t, g, parent_id, child_id, deleted_child_id),
        StructureEvent::CreateSuccessor {
            parent_id,
            old_id,
            new_id,
        } => events.create_successor(s, t, g, parent_id, old_id, new_id),
        StructureEvent::AddToFreelist { id } => events.add_to_freelist(s, t, g, id),
        StructureEvent::GrowTree { created_root_id } => events.grow_tree(s, t, g, created_root_id),
        StructureEvent::ShrinkTree { deleted_root_id } => {
            events.shrink_tree(s, t, g, deleted_root_id);
        }
        StructureEvent::Checkpoint {
            previous_stable,
            new_stable,
            new_unstable,
        } => events.checkpoint(s, t, previous_stable, new_stable, new_unstable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Collected {
        sessions: Vec<u64>,
        splits: Vec<(u64, PageId, PageId, PageId)>,
        checkpoints: Vec<(u64, u64, u64)>,
        freed: Vec<PageId>,
    }

    impl StructureEvents for Collected {
        fn split(
            &mut self,
            session_id: u64,
            _timestamp: u64,
            generation: u64,
            parent_id: PageId,
            child_id: PageId,
            created_child_id: PageId,
        ) {
            self.sessions.push(session_id);
            self.splits
                .push((generation, parent_id, child_id, created_child_id));
        }

        fn add_to_freelist(
            &mut self,
            session_id: u64,
            _timestamp: u64,
            _generation: u64,
            id: PageId,
        ) {
            self.sessions.push(session_id);
            self.freed.push(id);
        }

        fn checkpoint(
            &mut self,
            session_id: u64,
            _timestamp: u64,
            previous_stable: u64,
            new_stable: u64,
            new_unstable: u64,
        ) {
            self.sessions.push(session_id);
            self.checkpoints
                .push((previous_stable, new_stable, new_unstable));
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().expect("should create temp dir");
        let path = dir.path().join("structure.log");
        let log = StructureWriteLog::open(&path).expect("should open");
        log.log(
            2,
            StructureEvent::Split {
                parent_id: 3,
                child_id: 4,
                created_child_id: 5,
            },
        )
        .expect("should log");
        log.log(2, StructureEvent::AddToFreelist { id: 4 })
            .expect("should log");
        log.log(
            2,
            StructureEvent::Checkpoint {
                previous_stable: 1,
                new_stable: 2,
                new_unstable: 3,
            },
        )
        .expect("should log");
        log.flush().expect("should flush");

        let mut collected = Collected::default();
        let count = StructureWriteLog::read(&path, &mut collected).expect("should read");
        assert_eq!(count, 3);
        assert_eq!(collected.splits, vec![(2, 3, 4, 5)]);
        assert_eq!(collected.freed, vec![4]);
        assert_eq!(collected.checkpoints, vec![(1, 2, 3)]);
        assert!(collected.sessions.iter().all(|s| *s == log.session_id()));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = tempdir().expect("should create temp dir");
        let path = dir.path().join("structure.log");
        {
            let log = StructureWriteLog::open(&path).expect("should open");
            log.log(1, StructureEvent::GrowTree { created_root_id: 9 })
                .expect("should log");
            log.log(1, StructureEvent::ShrinkTree { deleted_root_id: 9 })
                .expect("should log");
            log.flush().expect("should flush");
        }
        let full = std::fs::read(&path).expect("should read file");
        std::fs::write(&path, &full[..full.len() - 3]).expect("should truncate");

        let count = StructureWriteLog::read(&path, &mut Collected::default()).expect("should read");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_sessions_differ_between_opens() {
        let dir = tempdir().expect("should create temp dir");
        let path = dir.path().join("structure.log");
        let first = StructureWriteLog::open(&path).expect("should open");
        let second = StructureWriteLog::open(&path).expect("should open");
        assert_ne!(first.session_id(), second.session_id());
    }
}
