use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redb::{Database as RedbDatabase, ReadableTable, Table, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::{BusError, Delivery, EventBus, PublishAck};
use crate::config::BusConfig;
use crate::storage::DatabaseError;

/// Message log: sequence -> StoredMessage (msgpack). Sequences start at 1.
const STREAM: TableDefinition<u64, &[u8]> = TableDefinition::new("stream");

/// "subject|idempotency_key" -> DedupEntry (msgpack)
const DEDUP: TableDefinition<&str, &[u8]> = TableDefinition::new("dedup");

/// "subject|group" -> next sequence to examine
const CURSORS: TableDefinition<&str, u64> = TableDefinition::new("cursors");

/// "subject|group|{sequence:020}" -> InFlight (msgpack)
const INFLIGHT: TableDefinition<&str, &[u8]> = TableDefinition::new("inflight");

/// "{published_at_ms:020}|subject|idempotency_key" -> sequence; orders dedup entries by age
const DEDUP_EXPIRY: TableDefinition<&str, u64> = TableDefinition::new("dedup_expiry");

/// Log-wide counters. Sequences keep growing after the stream is compacted.
const BUS_META: TableDefinition<&str, u64> = TableDefinition::new("bus_meta");

const LAST_SEQUENCE: &str = "last_sequence";

type BlobTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    subject: String,
    idempotency_key: String,
    payload: Vec<u8>,
    published_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DedupEntry {
    sequence: u64,
    published_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct InFlight {
    sequence: u64,
    attempts: u32,
    redeliver_at_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn check_name(name: &str) -> Result<(), BusError> {
    if name.is_empty() || name.contains('|') {
        return Err(BusError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn consumer_key(subject: &str, group: &str) -> String {
    format!("{subject}|{group}")
}

fn inflight_key(subject: &str, group: &str, sequence: u64) -> String {
    format!("{subject}|{group}|{sequence:020}")
}

fn expiry_key(published_at_ms: i64, dedup_key: &str) -> String {
    format!("{:020}|{dedup_key}", published_at_ms.max(0))
}

/// Remove dedup entries published before `cutoff_ms`.
fn prune_dedup(
    dedup: &mut BlobTable<'_>,
    expiry: &mut Table<'_, &'static str, u64>,
    cutoff_ms: i64,
) -> Result<usize, DatabaseError> {
    let bound = expiry_key(cutoff_ms, "");
    let expired: Vec<String> = expiry
        .range(..bound.as_str())?
        .map(|entry| entry.map(|(key, _)| key.value().to_string()))
        .collect::<Result<_, _>>()?;

    for key in &expired {
        expiry.remove(key.as_str())?;
        let Some((published, dedup_key)) = key.split_once('|') else {
            continue;
        };
        let current: Option<DedupEntry> = match dedup.get(dedup_key)? {
            Some(data) => Some(decode(data.value())?),
            None => None,
        };
        // The key may have been published again since; that entry is younger.
        if current.is_some_and(|entry| published.parse() == Ok(entry.published_at_ms)) {
            dedup.remove(dedup_key)?;
        }
    }
    Ok(expired.len())
}

/// Drop messages every known group has moved past and settled, once older
/// than `cutoff_ms`. No group yet means nothing is compacted.
fn compact_stream(
    stream: &mut Table<'_, u64, &'static [u8]>,
    cursors: &impl ReadableTable<&'static str, u64>,
    inflight: &impl ReadableTable<&'static str, &'static [u8]>,
    cutoff_ms: i64,
) -> Result<usize, DatabaseError> {
    let mut floor: Option<u64> = None;
    for entry in cursors.iter()? {
        let (_, cursor) = entry?;
        floor = Some(floor.map_or(cursor.value(), |f| f.min(cursor.value())));
    }
    let Some(mut floor) = floor else {
        return Ok(0);
    };
    for entry in inflight.iter()? {
        let (_, value) = entry?;
        let state: InFlight = decode(value.value())?;
        floor = floor.min(state.sequence);
    }

    let mut stale = Vec::new();
    for entry in stream.range(..floor)? {
        let (key, value) = entry?;
        let message: StoredMessage = decode(value.value())?;
        if message.published_at_ms > cutoff_ms {
            break;
        }
        stale.push(key.value());
    }
    for sequence in &stale {
        stream.remove(sequence)?;
    }
    Ok(stale.len())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DatabaseError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, DatabaseError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Durable event log with per-group cursors, backed by a redb file.
///
/// Every delivery is tracked in flight until acked. A delivery that is
/// neither acked nor nak'd becomes due again after `ack_wait`, so a consumer
/// that dies mid-message does not lose it.
///
/// Dedup entries expire after `dedup_window`. A message is compacted once it
/// is older than `retention` and every group that has fetched from the log
/// has moved past it with nothing in flight; a group that first fetches later
/// starts from the oldest retained message.
pub struct RedbBus {
    db: Arc<RedbDatabase>,
    notify: Notify,
    ack_wait: Duration,
    dedup_window: Duration,
    retention: Duration,
}

impl RedbBus {
    /// Open or create the event log under `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, config: &BusConfig) -> Result<Self, BusError> {
        Ok(Self::open_log(dir.as_ref(), config)?)
    }

    fn open_log(dir: &Path, config: &BusConfig) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(dir)?;
        let db = Arc::new(RedbDatabase::create(dir.join("events.redb"))?);

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(STREAM)?;
            let _ = write_txn.open_table(DEDUP)?;
            let _ = write_txn.open_table(CURSORS)?;
            let _ = write_txn.open_table(INFLIGHT)?;
            let _ = write_txn.open_table(DEDUP_EXPIRY)?;
            let _ = write_txn.open_table(BUS_META)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            notify: Notify::new(),
            ack_wait: config.ack_wait(),
            dedup_window: config.dedup_window(),
            retention: config.retention(),
        })
    }

    fn append(
        &self,
        subject: &str,
        idempotency_key: &str,
        payload: &[u8],
    ) -> Result<PublishAck, DatabaseError> {
        let now = now_ms();
        let dedup_key = format!("{subject}|{idempotency_key}");

        let write_txn = self.db.begin_write()?;
        let ack = {
            let mut stream = write_txn.open_table(STREAM)?;
            let mut dedup = write_txn.open_table(DEDUP)?;
            let mut expiry = write_txn.open_table(DEDUP_EXPIRY)?;
            let mut meta = write_txn.open_table(BUS_META)?;

            let cutoff = now.saturating_sub(millis(self.dedup_window));
            let pruned = prune_dedup(&mut dedup, &mut expiry, cutoff)?;
            if pruned > 0 {
                tracing::debug!(pruned, "Expired dedup entries");
            }

            let previous: Option<DedupEntry> = match dedup.get(dedup_key.as_str())? {
                Some(data) => Some(decode(data.value())?),
                None => None,
            };

            match previous {
                Some(entry) if now - entry.published_at_ms < millis(self.dedup_window) => {
                    PublishAck {
                        sequence: entry.sequence,
                        duplicate: true,
                    }
                }
                _ => {
                    let sequence = meta.get(LAST_SEQUENCE)?.map_or(0, |v| v.value()) + 1;
                    meta.insert(LAST_SEQUENCE, sequence)?;

                    let message = encode(&StoredMessage {
                        subject: subject.to_string(),
                        idempotency_key: idempotency_key.to_string(),
                        payload: payload.to_vec(),
                        published_at_ms: now,
                    })?;
                    stream.insert(sequence, message.as_slice())?;

                    let entry = encode(&DedupEntry {
                        sequence,
                        published_at_ms: now,
                    })?;
                    dedup.insert(dedup_key.as_str(), entry.as_slice())?;
                    expiry.insert(expiry_key(now, &dedup_key).as_str(), sequence)?;

                    PublishAck {
                        sequence,
                        duplicate: false,
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(ack)
    }

    fn next_delivery(&self, subject: &str, group: &str) -> Result<Option<Delivery>, DatabaseError> {
        let now = now_ms();
        let consumer = consumer_key(subject, group);
        let prefix = format!("{consumer}|");

        let write_txn = self.db.begin_write()?;
        let (delivery, changed) = {
            let stream = write_txn.open_table(STREAM)?;
            let mut cursors = write_txn.open_table(CURSORS)?;
            let mut inflight = write_txn.open_table(INFLIGHT)?;

            // Oldest in-flight message whose redelivery time has passed.
            let mut due: Option<(String, InFlight)> = None;
            for entry in inflight.range(prefix.as_str()..)? {
                let (key, value) = entry?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                let state: InFlight = decode(value.value())?;
                if state.redeliver_at_ms <= now {
                    due = Some((key.value().to_string(), state));
                    break;
                }
            }

            if let Some((key, mut state)) = due {
                let message: Option<StoredMessage> = match stream.get(state.sequence)? {
                    Some(data) => Some(decode(data.value())?),
                    None => None,
                };
                match message {
                    Some(message) => {
                        state.attempts += 1;
                        state.redeliver_at_ms = now.saturating_add(millis(self.ack_wait));
                        inflight.insert(key.as_str(), encode(&state)?.as_slice())?;
                        (Some(to_delivery(group, state.sequence, state.attempts, message)), true)
                    }
                    None => {
                        inflight.remove(key.as_str())?;
                        (None, true)
                    }
                }
            } else {
                let cursor = cursors
                    .get(consumer.as_str())?
                    .map(|v| v.value())
                    .unwrap_or(1);

                let mut next: Option<(u64, StoredMessage)> = None;
                let mut advanced_to = cursor;
                for entry in stream.range(cursor..)? {
                    let (key, value) = entry?;
                    let sequence = key.value();
                    advanced_to = sequence + 1;
                    let message: StoredMessage = decode(value.value())?;
                    if message.subject == subject {
                        next = Some((sequence, message));
                        break;
                    }
                }

                if advanced_to != cursor {
                    cursors.insert(consumer.as_str(), advanced_to)?;
                }

                match next {
                    Some((sequence, message)) => {
                        let state = InFlight {
                            sequence,
                            attempts: 1,
                            redeliver_at_ms: now.saturating_add(millis(self.ack_wait)),
                        };
                        let key = inflight_key(subject, group, sequence);
                        inflight.insert(key.as_str(), encode(&state)?.as_slice())?;
                        (Some(to_delivery(group, sequence, 1, message)), true)
                    }
                    None => (None, advanced_to != cursor),
                }
            }
        };

        if changed {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(delivery)
    }

    fn settle(&self, delivery: &Delivery, redeliver_after: Option<Duration>) -> Result<(), DatabaseError> {
        let key = inflight_key(&delivery.subject, &delivery.group, delivery.sequence);

        let write_txn = self.db.begin_write()?;
        {
            let mut inflight = write_txn.open_table(INFLIGHT)?;
            match redeliver_after {
                None => {
                    inflight.remove(key.as_str())?;

                    let mut stream = write_txn.open_table(STREAM)?;
                    let cursors = write_txn.open_table(CURSORS)?;
                    let cutoff = now_ms().saturating_sub(millis(self.retention));
                    let compacted = compact_stream(&mut stream, &cursors, &inflight, cutoff)?;
                    if compacted > 0 {
                        tracing::debug!(compacted, "Compacted settled messages");
                    }
                }
                Some(delay) => {
                    let state: Option<InFlight> = match inflight.get(key.as_str())? {
                        Some(data) => Some(decode(data.value())?),
                        None => None,
                    };
                    // Missing means it was already acked; nothing to reschedule.
                    if let Some(mut state) = state {
                        state.redeliver_at_ms = now_ms().saturating_add(millis(delay));
                        inflight.insert(key.as_str(), encode(&state)?.as_slice())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

fn to_delivery(group: &str, sequence: u64, attempt: u32, message: StoredMessage) -> Delivery {
    Delivery {
        subject: message.subject,
        group: group.to_string(),
        sequence,
        attempt,
        idempotency_key: message.idempotency_key,
        payload: Bytes::from(message.payload),
    }
}

#[async_trait]
impl EventBus for RedbBus {
    async fn publish(
        &self,
        subject: &str,
        idempotency_key: &str,
        payload: Bytes,
    ) -> Result<PublishAck, BusError> {
        check_name(subject)?;
        let ack = self.append(subject, idempotency_key, &payload)?;
        if !ack.duplicate {
            self.notify.notify_waiters();
        }
        Ok(ack)
    }

    async fn fetch(&self, subject: &str, group: &str) -> Result<Option<Delivery>, BusError> {
        check_name(subject)?;
        check_name(group)?;
        Ok(self.next_delivery(subject, group)?)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        Ok(self.settle(delivery, None)?)
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<(), BusError> {
        Ok(self.settle(delivery, Some(delay))?)
    }

    async fn wait_for_messages(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dedup_window_secs: u64, retention_secs: u64) -> BusConfig {
        BusConfig {
            ack_wait_ms: 200,
            retry_delay_ms: 50,
            poll_interval_ms: 20,
            dedup_window_secs,
            retention_secs,
        }
    }

    fn rows<K: redb::Key + 'static, V: redb::Value + 'static>(
        bus: &RedbBus,
        table: TableDefinition<K, V>,
    ) -> usize {
        let txn = bus.db.begin_read().unwrap();
        let table = txn.open_table(table).unwrap();
        table.iter().unwrap().count()
    }

    #[tokio::test]
    async fn expired_dedup_entries_are_pruned_on_publish() {
        let dir = tempfile::tempdir().unwrap();
        let bus = RedbBus::open(dir.path(), &config(0, 3600)).unwrap();

        bus.publish("files.uploaded", "a", Bytes::from("1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.publish("files.uploaded", "b", Bytes::from("2")).await.unwrap();

        assert_eq!(rows(&bus, DEDUP), 1);
        assert_eq!(rows(&bus, DEDUP_EXPIRY), 1);
    }

    #[tokio::test]
    async fn settled_messages_are_compacted() {
        let dir = tempfile::tempdir().unwrap();
        let bus = RedbBus::open(dir.path(), &config(120, 0)).unwrap();
        bus.publish("users.removed", "a", Bytes::from("a")).await.unwrap();
        bus.publish("users.removed", "b", Bytes::from("b")).await.unwrap();

        let slow = bus.fetch("users.removed", "g1").await.unwrap().unwrap();
        let fast = bus.fetch("users.removed", "g2").await.unwrap().unwrap();
        bus.ack(&fast).await.unwrap();
        // g1 still holds the first message in flight
        assert_eq!(rows(&bus, STREAM), 2);

        bus.ack(&slow).await.unwrap();
        assert_eq!(rows(&bus, STREAM), 1);

        let b1 = bus.fetch("users.removed", "g1").await.unwrap().unwrap();
        bus.ack(&b1).await.unwrap();
        // g2 has not moved past the second message yet
        assert_eq!(rows(&bus, STREAM), 1);
        let b2 = bus.fetch("users.removed", "g2").await.unwrap().unwrap();
        bus.ack(&b2).await.unwrap();
        assert_eq!(rows(&bus, STREAM), 0);

        // Sequences keep counting after the log is emptied
        let ack = bus.publish("users.removed", "c", Bytes::from("c")).await.unwrap();
        assert_eq!(ack.sequence, 3);

        let late = bus.fetch("users.removed", "g3").await.unwrap().unwrap();
        assert_eq!(late.idempotency_key, "c");
        assert_eq!(late.attempt, 1);
    }

    #[tokio::test]
    async fn messages_inside_retention_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let bus = RedbBus::open(dir.path(), &config(120, 3600)).unwrap();
        bus.publish("files.uploaded", "a", Bytes::from("a")).await.unwrap();

        let first = bus.fetch("files.uploaded", "audit").await.unwrap().unwrap();
        bus.ack(&first).await.unwrap();
        assert_eq!(rows(&bus, STREAM), 1);

        let late = bus.fetch("files.uploaded", "search").await.unwrap().unwrap();
        assert_eq!(late.sequence, first.sequence);
    }
}
