//! Bounded, append-only, topic-keyed event log.
//!
//! Entry ids are `<millis>-<seq>` pairs, strictly increasing per topic. Each
//! append auto-trims the topic once it overshoots the bound by a slack
//! margin (the "approximate" trim contract). The buffer survives a graceful
//! restart via JSON snapshots; crash loss is tolerated by the pipeline.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use renderflow_protocol::defaults::EVENT_BUFFER_MAX_LEN;

/// Monotonic per-topic entry id, ordered by (millis, seq).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId {
    pub millis: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.to_string()
    }
}

impl FromStr for StreamId {
    type Err = StreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| StreamIdError(s.to_string()))?;
        Ok(Self {
            millis: millis.parse().map_err(|_| StreamIdError(s.to_string()))?,
            seq: seq.parse().map_err(|_| StreamIdError(s.to_string()))?,
        })
    }
}

impl TryFrom<String> for StreamId {
    type Error = StreamIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid stream id: {0}")]
pub struct StreamIdError(String);

/// A single telemetry record: id plus a flat string map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBufferEntry {
    pub id: StreamId,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TopicLog {
    entries: VecDeque<EventBufferEntry>,
    last_id: StreamId,
}

/// Bounded append-only in-memory streaming log.
///
/// Appends are a short mutex hold plus a push; the p99 < 1 ms target holds
/// comfortably. Shared behind `Arc` across the capture layer, the workers
/// and the transfer tasks of one process.
pub struct EventBuffer {
    topics: Mutex<HashMap<String, TopicLog>>,
    max_len: usize,
    trim_slack: usize,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::with_bound(EVENT_BUFFER_MAX_LEN)
    }

    /// Buffer with a custom bound; slack is 1% (min 10 entries).
    pub fn with_bound(max_len: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            max_len,
            trim_slack: (max_len / 100).max(10),
        }
    }

    /// Append fields to a topic, returning the assigned id.
    ///
    /// Auto-trims the topic to `max_len` once it overshoots by the slack
    /// margin, so the amortized append cost stays flat.
    pub fn append(&self, topic: &str, fields: BTreeMap<String, String>) -> StreamId {
        let mut topics = self.topics.lock().expect("event buffer poisoned");
        let log = topics.entry(topic.to_string()).or_default();

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let id = if now_ms > log.last_id.millis {
            StreamId::new(now_ms, 0)
        } else {
            StreamId::new(log.last_id.millis, log.last_id.seq + 1)
        };
        log.last_id = id;
        log.entries.push_back(EventBufferEntry {
            id,
            fields,
        });

        if log.entries.len() > self.max_len + self.trim_slack {
            let excess = log.entries.len() - self.max_len;
            log.entries.drain(..excess);
            debug!("Trimmed {} entries from topic {}", excess, topic);
        }

        id
    }

    /// Ordered slice of up to `count` entries with id strictly greater than
    /// `from`. `StreamId::ZERO` reads from the earliest retained entry.
    pub fn range(&self, topic: &str, from: StreamId, count: usize) -> Vec<EventBufferEntry> {
        let topics = self.topics.lock().expect("event buffer poisoned");
        let Some(log) = topics.get(topic) else {
            return Vec::new();
        };
        log.entries
            .iter()
            .filter(|entry| entry.id > from)
            .take(count)
            .cloned()
            .collect()
    }

    /// Current length of a topic.
    pub fn len(&self, topic: &str) -> usize {
        let topics = self.topics.lock().expect("event buffer poisoned");
        topics.get(topic).map(|log| log.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Drop oldest entries until the topic holds at most `max_len`.
    ///
    /// In approximate mode the trim is skipped while the overshoot is within
    /// the slack margin, mirroring the cheaper almost-exact contract.
    pub fn trim(&self, topic: &str, max_len: usize, approximate: bool) {
        let mut topics = self.topics.lock().expect("event buffer poisoned");
        let Some(log) = topics.get_mut(topic) else {
            return;
        };
        let threshold = if approximate {
            max_len + self.trim_slack
        } else {
            max_len
        };
        if log.entries.len() > threshold {
            let excess = log.entries.len() - max_len;
            log.entries.drain(..excess);
            debug!("Trimmed {} entries from topic {}", excess, topic);
        }
    }

    /// Serialize all topics to a JSON file (graceful-shutdown durability).
    pub fn snapshot_to(&self, path: &Path) -> std::io::Result<()> {
        let topics = self.topics.lock().expect("event buffer poisoned");
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(file, &*topics)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(())
    }

    /// Restore topics from a snapshot file. Missing file is a clean start.
    pub fn restore_from(&self, path: &Path) -> std::io::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let file = std::fs::File::open(path)?;
        match serde_json::from_reader::<_, HashMap<String, TopicLog>>(file) {
            Ok(restored) => {
                let mut topics = self.topics.lock().expect("event buffer poisoned");
                *topics = restored;
                Ok(())
            }
            Err(e) => {
                warn!("Discarding unreadable event buffer snapshot: {e}");
                Ok(())
            }
        }
    }
}
