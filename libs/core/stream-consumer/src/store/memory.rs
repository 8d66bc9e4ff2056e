//! In-process stream store
//!
//! Mirrors Redis consumer-group semantics closely enough to drive the worker
//! end to end: a per-group pending-entries list with owners, delivery counts
//! and idle times, blocking reads, `MAXLEN`-style trimming. Operations can be
//! made to fail on demand to exercise retry and recovery paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{PendingInfo, StreamStore};
use crate::error::ConsumerError;
use crate::message::{EntryId, Fields, Message};

/// Store operation, used to target failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    EnsureGroup,
    ReadGroup,
    Pending,
    Claim,
    Ack,
    Append,
    Ping,
}

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingState>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn next_id(&mut self) -> Result<EntryId, ConsumerError> {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let id = if now_ms > self.last_id.ms() {
            EntryId::new(now_ms, 0)
        } else {
            self.last_id.next().ok_or_else(|| {
                ConsumerError::Store("ERR The stream has exhausted the last possible ID".into())
            })?
        };
        self.last_id = id;
        Ok(id)
    }
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamState>,
    failures: HashMap<StoreOp, u32>,
    disconnected: bool,
    acked: Vec<(String, EntryId)>,
}

impl State {
    fn check(&mut self, op: StoreOp) -> Result<(), ConsumerError> {
        if self.disconnected {
            return Err(ConsumerError::Connection("connection refused".to_string()));
        }
        if let Some(remaining) = self.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ConsumerError::Store(format!("injected {:?} failure", op)));
            }
        }
        Ok(())
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut GroupState, ConsumerError> {
        self.streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| nogroup(stream, group))
    }

    fn group(&self, stream: &str, group: &str) -> Option<&GroupState> {
        self.streams.get(stream).and_then(|s| s.groups.get(group))
    }
}

fn nogroup(stream: &str, group: &str) -> ConsumerError {
    ConsumerError::Store(format!(
        "NOGROUP No such key '{}' or consumer group '{}'",
        stream, group
    ))
}

/// In-memory [`StreamStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    appended: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry without going through failure injection
    ///
    /// # Panics
    ///
    /// Panics if the stream has run out of entry IDs.
    pub fn push(&self, stream: &str, fields: &[(&str, &str)]) -> EntryId {
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();

        let id = {
            let mut state = self.state();
            let s = state.streams.entry(stream.to_string()).or_default();
            let id = s.next_id().expect("stream entry IDs exhausted");
            s.entries.insert(id, fields);
            id
        };
        self.appended.notify_waiters();
        id
    }

    /// Make the next `times` calls of `op` fail with a store error
    pub fn fail_next(&self, op: StoreOp, times: u32) {
        self.state().failures.insert(op, times);
    }

    /// Make every operation fail with a connection error until [`reconnect`](Self::reconnect)
    pub fn disconnect(&self) {
        self.state().disconnected = true;
    }

    pub fn reconnect(&self) {
        self.state().disconnected = false;
    }

    /// Number of entries currently in the stream
    pub fn len(&self, stream: &str) -> usize {
        self.state()
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len())
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    pub fn entries(&self, stream: &str) -> Vec<(EntryId, Fields)> {
        self.state()
            .streams
            .get(stream)
            .map(|s| s.entries.iter().map(|(id, f)| (*id, f.clone())).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state()
            .group(stream, group)
            .map_or(0, |g| g.pending.len())
    }

    pub fn pending_entries(&self, stream: &str, group: &str) -> Vec<PendingInfo> {
        let now = Instant::now();
        self.state()
            .group(stream, group)
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, p)| pending_info(*id, p, now))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn delivery_count(&self, stream: &str, group: &str, id: EntryId) -> Option<u32> {
        self.state()
            .group(stream, group)
            .and_then(|g| g.pending.get(&id))
            .map(|p| p.delivery_count)
    }

    /// Successful acknowledgments in call order
    pub fn acked(&self) -> Vec<(String, EntryId)> {
        self.state().acked.clone()
    }

    /// Pretend every pending entry of the group was delivered `by` earlier
    pub fn age_pending(&self, stream: &str, group: &str, by: Duration) {
        let mut state = self.state();
        if let Some(g) = state.streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            for p in g.pending.values_mut() {
                if let Some(earlier) = p.delivered_at.checked_sub(by) {
                    p.delivered_at = earlier;
                }
            }
        }
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<Message>, ConsumerError> {
        let mut state = self.state();
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| nogroup(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| nogroup(stream, group))?;

        let now = Instant::now();
        let fresh: Vec<(EntryId, Fields)> = match g.last_delivered.next() {
            Some(from) => s
                .entries
                .range(from..)
                .take(count)
                .map(|(id, f)| (*id, f.clone()))
                .collect(),
            None => Vec::new(),
        };

        let mut messages = Vec::with_capacity(fresh.len());
        for (id, fields) in fresh {
            g.last_delivered = id;
            g.pending.insert(
                id,
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            messages.push(Message::new(id, fields, 1));
        }

        Ok(messages)
    }
}

fn pending_info(id: EntryId, p: &PendingState, now: Instant) -> PendingInfo {
    PendingInfo {
        id,
        consumer: p.consumer.clone(),
        idle: now.saturating_duration_since(p.delivered_at),
        delivery_count: p.delivery_count,
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<bool, ConsumerError> {
        let mut state = self.state();
        state.check(StoreOp::EnsureGroup)?;

        let s = state.streams.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Ok(false);
        }

        let last_delivered = match start_id {
            "$" => s.last_id,
            "0" | "0-0" => EntryId::MIN,
            other => other.parse()?,
        };
        s.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Message>, ConsumerError> {
        // BLOCK 0 waits forever, like Redis
        let deadline = block
            .filter(|d| !d.is_zero())
            .map(|d| Instant::now() + d);

        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            self.state().check(StoreOp::ReadGroup)?;
            let messages = self.try_read(stream, group, consumer, count)?;
            if !messages.is_empty() || block.is_none() {
                return Ok(messages);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, appended).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
                None => appended.await,
            }
        }
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingInfo>, ConsumerError> {
        let mut state = self.state();
        state.check(StoreOp::Pending)?;

        let now = Instant::now();
        let g = state.group_mut(stream, group)?;
        Ok(g.pending
            .iter()
            .map(|(id, p)| pending_info(*id, p, now))
            .filter(|info| info.idle >= min_idle)
            .take(count)
            .collect())
    }

    async fn pending_for(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<PendingInfo>, ConsumerError> {
        let mut state = self.state();
        state.check(StoreOp::Pending)?;

        let now = Instant::now();
        let g = state.group_mut(stream, group)?;
        Ok(g.pending
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .take(count)
            .map(|(id, p)| pending_info(*id, p, now))
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<Message>, ConsumerError> {
        let mut state = self.state();
        state.check(StoreOp::Claim)?;

        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| nogroup(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| nogroup(stream, group))?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for id in ids {
            let idle_enough = match g.pending.get(id) {
                Some(p) => now.saturating_duration_since(p.delivered_at) >= min_idle,
                None => continue,
            };
            if !idle_enough {
                continue;
            }

            // Trimmed entries are dropped from the PEL instead of claimed
            let Some(fields) = s.entries.get(id) else {
                g.pending.remove(id);
                continue;
            };
            let Some(p) = g.pending.get_mut(id) else {
                continue;
            };

            p.consumer = consumer.to_string();
            p.delivered_at = now;
            p.delivery_count += 1;
            claimed.push(Message::new(*id, fields.clone(), 1).with_delivery_count(p.delivery_count));
        }

        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, ConsumerError> {
        let mut state = self.state();
        state.check(StoreOp::Ack)?;

        let removed = match state.group_mut(stream, group) {
            Ok(g) => g.pending.remove(&id).is_some(),
            Err(_) => false,
        };
        if removed {
            state.acked.push((stream.to_string(), id));
        }
        Ok(removed)
    }

    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> Result<EntryId, ConsumerError> {
        let id = {
            let mut state = self.state();
            state.check(StoreOp::Append)?;

            let s = state.streams.entry(stream.to_string()).or_default();
            let id = s.next_id()?;
            s.entries.insert(id, fields);
            if let Some(max_len) = max_len {
                while s.entries.len() > max_len {
                    s.entries.pop_first();
                }
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ping(&self) -> Result<(), ConsumerError> {
        self.state().check(StoreOp::Ping)
    }

    fn is_healthy(&self) -> bool {
        !self.state().disconnected
    }
}
