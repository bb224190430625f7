//! Live log fan-out with durable replay (C3).
//!
//! Every log line is persisted before it is broadcast, and the in-memory
//! sequence counter is reloaded from the store on first touch of a build so
//! that a restarted process never reuses a sequence number (I1-I3). A bounded
//! ring buffer backs late subscribers; the `broadcast` channel backs live
//! tailers. Subscribers read history, then the channel, with no gap between
//! the two (I4) because the receiver is created before the snapshot is taken.

use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;

use crate::db::Db;
use crate::types::{BuildLogEntry, LogEntryType};

const MAX_HISTORY_ENTRIES: usize = 10_000;
const CHANNEL_CAPACITY: usize = 1024;

struct BuildStream {
    tx: broadcast::Sender<BuildLogEntry>,
    history: VecDeque<BuildLogEntry>,
    next_sequence: u32,
    ended: bool,
}

impl BuildStream {
    fn new(next_sequence: u32) -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, history: VecDeque::new(), next_sequence, ended: false }
    }

    fn push(&mut self, entry: BuildLogEntry) {
        if self.history.len() >= MAX_HISTORY_ENTRIES {
            self.history.pop_front();
        }
        self.history.push_back(entry.clone());
        // No subscribers is not an error: history still holds the line.
        let _ = self.tx.send(entry);
    }
}

/// Per-process fan-out manager for build log lines (C3).
pub struct LogTransport {
    db: Arc<Db>,
    streams: AsyncMutex<HashMap<i64, BuildStream>>,
}

impl LogTransport {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db, streams: AsyncMutex::new(HashMap::new()) }
    }

    async fn ensure_stream<'a>(
        streams: &'a mut HashMap<i64, BuildStream>,
        db: &Db,
        build_id: i64,
    ) -> Result<&'a mut BuildStream> {
        if !streams.contains_key(&build_id) {
            let max_seq = db.max_log_sequence(build_id)?;
            streams.insert(build_id, BuildStream::new(max_seq + 1));
        }
        Ok(streams.get_mut(&build_id).expect("just inserted"))
    }

    /// Append one log line: persist first, then fan out (I1/I2).
    pub async fn append(
        &self,
        build_id: i64,
        entry_type: LogEntryType,
        message: impl Into<String>,
        step_name: Option<String>,
    ) -> Result<u32> {
        let mut streams = self.streams.lock().await;
        let stream = Self::ensure_stream(&mut streams, &self.db, build_id).await?;
        let sequence = stream.next_sequence;
        stream.next_sequence += 1;

        let entry = BuildLogEntry {
            build_id,
            sequence,
            entry_type,
            message: message.into(),
            step_name,
            timestamp: Utc::now(),
        };
        self.db.append_log_entry(&entry)?;
        stream.push(entry);
        Ok(sequence)
    }

    /// Subscribe to live lines, returning a receiver created before any
    /// snapshot is read by the caller so no line can be missed (I4).
    pub async fn subscribe(&self, build_id: i64) -> Result<broadcast::Receiver<BuildLogEntry>> {
        let mut streams = self.streams.lock().await;
        let stream = Self::ensure_stream(&mut streams, &self.db, build_id).await?;
        Ok(stream.tx.subscribe())
    }

    /// All entries with `sequence > after_sequence`, from history if resident
    /// or from the store otherwise (e.g. after process restart).
    pub async fn get_since(&self, build_id: i64, after_sequence: u32) -> Result<Vec<BuildLogEntry>> {
        let streams = self.streams.lock().await;
        if let Some(stream) = streams.get(&build_id) {
            if stream
                .history
                .front()
                .map(|e| e.sequence <= after_sequence + 1)
                .unwrap_or(true)
            {
                return Ok(stream
                    .history
                    .iter()
                    .filter(|e| e.sequence > after_sequence)
                    .cloned()
                    .collect());
            }
        }
        drop(streams);
        self.db.get_log_entries_since(build_id, after_sequence, MAX_HISTORY_ENTRIES as u32)
    }

    pub async fn end_build(&self, build_id: i64) {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get_mut(&build_id) {
            stream.ended = true;
        }
    }

    pub async fn is_ended(&self, build_id: i64) -> bool {
        let streams = self.streams.lock().await;
        streams.get(&build_id).map(|s| s.ended).unwrap_or(false)
    }

    /// Drop in-memory state for builds no longer needed once drained by all
    /// subscribers; history remains recoverable via `Db::get_log_entries_since`.
    pub async fn evict(&self, build_id: i64) {
        self.streams.lock().await.remove(&build_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewBuild, Trigger};

    async fn setup() -> (Arc<Db>, i64) {
        let db = Arc::new(Db::open_in_memory().expect("open"));
        db.migrate().expect("migrate");
        let project = crate::types::Project {
            id: 0,
            external_repo_id: "x".into(),
            owner: "o".into(),
            name: "n".into(),
            default_branch: "main".into(),
            installation_id: "".into(),
            webhook_secret: "".into(),
            branch_filter: "".into(),
            enable_pr_builds: true,
            timeout_minutes: 15,
            container_image: None,
            profile: None,
            required_secrets: vec![],
            notify_on_failure: false,
            last_build_at: None,
            created_at: Utc::now(),
        };
        let project_id = db.insert_project(&project).expect("insert project");
        let (build_id, _) = db
            .enqueue_build(&NewBuild {
                project_id,
                commit_sha: "f".repeat(40),
                branch: "main".into(),
                commit_message: None,
                commit_author: None,
                pull_request_number: None,
                trigger: Trigger::Push,
            })
            .expect("enqueue");
        (db, build_id)
    }

    #[tokio::test]
    async fn subscribe_before_snapshot_misses_nothing() {
        let (db, build_id) = setup().await;
        let transport = LogTransport::new(db);

        transport
            .append(build_id, LogEntryType::Info, "line 1", None)
            .await
            .expect("append 1");

        let mut rx = transport.subscribe(build_id).await.expect("subscribe");
        let since = transport.get_since(build_id, 0).await.expect("since");
        assert_eq!(since.len(), 1);

        transport
            .append(build_id, LogEntryType::Info, "line 2", None)
            .await
            .expect("append 2");
        let received = rx.recv().await.expect("recv");
        assert_eq!(received.sequence, 2);
        assert_eq!(received.message, "line 2");
    }

    #[tokio::test]
    async fn sequence_reloads_from_store_after_eviction() {
        let (db, build_id) = setup().await;
        {
            let transport = LogTransport::new(Arc::clone(&db));
            transport.append(build_id, LogEntryType::Info, "a", None).await.expect("a");
            transport.append(build_id, LogEntryType::Info, "b", None).await.expect("b");
        }
        // Simulate a fresh process: new transport, same db.
        let transport = LogTransport::new(db);
        let sequence = transport
            .append(build_id, LogEntryType::Info, "c", None)
            .await
            .expect("c");
        assert_eq!(sequence, 3);
    }
}
