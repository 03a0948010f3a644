//! In-process broker.
//!
//! [`MemoryBroker`] keeps partitioned append-only logs, consumer groups with
//! range partition assignment, and committed offsets per group. Cloning it
//! yields another handle to the same broker, so several
//! [`DistributedBus`](crate::DistributedBus) instances in one process behave
//! like separate services sharing a cluster.

use super::{
    Broker, BrokerError, BrokerResult, ConsumedRecord, GroupConsumer, NewTopic, OutboundRecord,
    RecordMetadata,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct TopicState {
    partitions: Vec<Vec<StoredRecord>>,
    replication_factor: i16,
}

#[derive(Debug)]
struct GroupState {
    topic: String,
    /// member id -> owned partitions
    members: BTreeMap<u64, Vec<u32>>,
    generation: u64,
    /// partition -> next offset to consume
    committed: HashMap<u32, u64>,
}

impl GroupState {
    /// Range assignment: contiguous blocks, earlier members take the remainder.
    fn rebalance(&mut self, partitions: u32) {
        let count = self.members.len() as u32;
        self.generation += 1;
        if count == 0 {
            return;
        }

        let per_member = partitions / count;
        let extra = partitions % count;
        let mut next = 0;
        for (index, owned) in self.members.values_mut().enumerate() {
            let take = per_member + u32::from((index as u32) < extra);
            *owned = (next..next + take).collect();
            next += take;
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    failing_connects: usize,
    /// Next create request behaves as if another client created the topics first
    racing_create: bool,
    topics: BTreeMap<String, TopicState>,
    groups: HashMap<String, GroupState>,
    next_member_id: u64,
    connect_attempts: usize,
    create_requests: usize,
    flushes: usize,
}

impl BrokerState {
    fn ensure_reachable(&self) -> BrokerResult<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(BrokerError::Unreachable("memory broker is offline".to_string()))
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BrokerState>,
    changed: Notify,
}

/// In-process message broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty, reachable broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState {
                    reachable: true,
                    failing_connects: 0,
                    racing_create: false,
                    topics: BTreeMap::new(),
                    groups: HashMap::new(),
                    next_member_id: 1,
                    connect_attempts: 0,
                    create_requests: 0,
                    flushes: 0,
                }),
                changed: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the broker offline or bring it back.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
        self.inner.changed.notify_waiters();
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    /// Make the next `create_topics` request lose a race: the topics end up
    /// created, but the request reports them as already existing.
    pub fn race_next_create(&self) {
        self.lock().racing_create = true;
    }

    /// Number of `connect` calls received.
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Number of `create_topics` requests received.
    pub fn create_topic_requests(&self) -> usize {
        self.lock().create_requests
    }

    /// Number of producer flushes received.
    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }

    /// Existing topic names, sorted.
    pub fn topic_names(&self) -> Vec<String> {
        self.lock().topics.keys().cloned().collect()
    }

    /// Replication factor a topic was created with.
    pub fn replication_factor(&self, topic: &str) -> Option<i16> {
        self.lock().topics.get(topic).map(|t| t.replication_factor)
    }

    /// Keys of the records stored in one partition, in offset order.
    pub fn partition_keys(&self, topic: &str, partition: u32) -> Vec<Option<String>> {
        self.lock()
            .topics
            .get(topic)
            .and_then(|t| t.partitions.get(partition as usize))
            .map(|records| records.iter().map(|r| r.key.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of records stored in one partition.
    pub fn partition_len(&self, topic: &str, partition: u32) -> usize {
        self.partition_keys(topic, partition).len()
    }

    /// Next offset the group will consume from `partition`, if committed.
    pub fn committed_offset(&self, group_id: &str, partition: u32) -> Option<u64> {
        self.lock()
            .groups
            .get(group_id)
            .and_then(|g| g.committed.get(&partition).copied())
    }

    /// Current partition ownership of a group, by member id.
    pub fn group_assignment(&self, group_id: &str) -> BTreeMap<u64, Vec<u32>> {
        self.lock()
            .groups
            .get(group_id)
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }

    /// Ids of the groups consuming `topic`, sorted.
    pub fn groups_for_topic(&self, topic: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .lock()
            .groups
            .iter()
            .filter(|(_, g)| g.topic == topic && !g.members.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        groups.sort();
        groups
    }

    fn remove_member(&self, group_id: &str, member_id: u64) {
        {
            let mut state = self.lock();
            let partitions = match state.groups.get(group_id) {
                Some(group) => state.topics.get(&group.topic).map(|t| t.partitions.len() as u32),
                None => return,
            };
            if let Some(group) = state.groups.get_mut(group_id) {
                if group.members.remove(&member_id).is_some() {
                    group.rebalance(partitions.unwrap_or(0));
                    tracing::debug!(group_id = %group_id, member_id, "Member left group");
                }
            }
        }
        self.inner.changed.notify_waiters();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> BrokerResult<()> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        state.ensure_reachable()?;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn list_topics(&self) -> BrokerResult<Vec<String>> {
        let state = self.lock();
        state.ensure_reachable()?;
        Ok(state.topics.keys().cloned().collect())
    }

    async fn create_topics(&self, topics: &[NewTopic]) -> BrokerResult<()> {
        let mut state = self.lock();
        state.ensure_reachable()?;
        state.create_requests += 1;
        let raced = std::mem::take(&mut state.racing_create);

        let mut first_conflict = None;
        for topic in topics {
            if topic.partitions == 0 {
                return Err(BrokerError::Client(format!(
                    "topic {} needs at least one partition",
                    topic.name
                )));
            }
            if state.topics.contains_key(&topic.name) {
                first_conflict.get_or_insert_with(|| topic.name.clone());
                continue;
            }
            state.topics.insert(
                topic.name.clone(),
                TopicState {
                    partitions: (0..topic.partitions).map(|_| Vec::new()).collect(),
                    replication_factor: topic.replication_factor,
                },
            );
        }

        if raced {
            first_conflict = first_conflict.or_else(|| topics.first().map(|t| t.name.clone()));
        }

        match first_conflict {
            Some(name) => Err(BrokerError::TopicAlreadyExists(name)),
            None => Ok(()),
        }
    }

    async fn partition_count(&self, topic: &str) -> BrokerResult<u32> {
        let state = self.lock();
        state.ensure_reachable()?;
        state
            .topics
            .get(topic)
            .map(|t| t.partitions.len() as u32)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    async fn send(&self, record: OutboundRecord) -> BrokerResult<RecordMetadata> {
        let metadata = {
            let mut state = self.lock();
            state.ensure_reachable()?;
            let topic = state
                .topics
                .get_mut(&record.topic)
                .ok_or_else(|| BrokerError::UnknownTopic(record.topic.clone()))?;
            let log = topic
                .partitions
                .get_mut(record.partition as usize)
                .ok_or_else(|| BrokerError::UnknownPartition {
                    topic: record.topic.clone(),
                    partition: record.partition,
                })?;
            log.push(StoredRecord {
                key: record.key,
                payload: record.payload,
            });
            RecordMetadata {
                partition: record.partition,
                offset: (log.len() - 1) as u64,
            }
        };
        self.inner.changed.notify_waiters();
        Ok(metadata)
    }

    async fn flush(&self) -> BrokerResult<()> {
        let mut state = self.lock();
        state.ensure_reachable()?;
        state.flushes += 1;
        Ok(())
    }

    async fn join_group(&self, group_id: &str, topic: &str) -> BrokerResult<Box<dyn GroupConsumer>> {
        let member_id = {
            let mut state = self.lock();
            state.ensure_reachable()?;
            let partitions = state
                .topics
                .get(topic)
                .map(|t| t.partitions.len() as u32)
                .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

            let member_id = state.next_member_id;
            state.next_member_id += 1;

            let group = state
                .groups
                .entry(group_id.to_string())
                .or_insert_with(|| GroupState {
                    topic: topic.to_string(),
                    members: BTreeMap::new(),
                    generation: 0,
                    committed: HashMap::new(),
                });
            if group.topic != topic {
                return Err(BrokerError::Client(format!(
                    "group {} already consumes topic {}",
                    group_id, group.topic
                )));
            }
            group.members.insert(member_id, Vec::new());
            group.rebalance(partitions);
            member_id
        };
        self.inner.changed.notify_waiters();

        tracing::debug!(group_id = %group_id, topic = %topic, member_id, "Member joined group");

        Ok(Box::new(MemoryGroupConsumer {
            broker: self.clone(),
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            member_id,
            generation: 0,
            assigned: Vec::new(),
            positions: HashMap::new(),
            cursor: 0,
            left: false,
        }))
    }
}

/// Group member handed out by [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryGroupConsumer {
    broker: MemoryBroker,
    group_id: String,
    topic: String,
    member_id: u64,
    /// Generation the local view was last synced to
    generation: u64,
    assigned: Vec<u32>,
    /// partition -> next offset to fetch
    positions: HashMap<u32, u64>,
    cursor: usize,
    left: bool,
}

impl MemoryGroupConsumer {
    /// Member id assigned by the broker.
    pub fn member_id(&self) -> u64 {
        self.member_id
    }

    fn try_next(&mut self) -> BrokerResult<Option<ConsumedRecord>> {
        let broker = self.broker.clone();
        let state = broker.lock();
        state.ensure_reachable()?;

        let group = state
            .groups
            .get(&self.group_id)
            .ok_or_else(|| BrokerError::NotMember(self.group_id.clone()))?;
        let owned = group
            .members
            .get(&self.member_id)
            .ok_or_else(|| BrokerError::NotMember(self.group_id.clone()))?;

        // After a rebalance, resume every owned partition from the committed offset.
        if group.generation != self.generation {
            self.generation = group.generation;
            self.assigned = owned.clone();
            self.positions = owned
                .iter()
                .map(|p| (*p, group.committed.get(p).copied().unwrap_or(0)))
                .collect();
            self.cursor = 0;
        }

        let topic = state
            .topics
            .get(&self.topic)
            .ok_or_else(|| BrokerError::UnknownTopic(self.topic.clone()))?;

        let count = self.assigned.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let partition = self.assigned[index];
            let position = self.positions.get(&partition).copied().unwrap_or(0);
            let stored = topic
                .partitions
                .get(partition as usize)
                .and_then(|log| log.get(position as usize));
            if let Some(stored) = stored {
                self.positions.insert(partition, position + 1);
                self.cursor = (index + 1) % count;
                return Ok(Some(ConsumedRecord {
                    topic: self.topic.clone(),
                    partition,
                    offset: position,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                }));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl GroupConsumer for MemoryGroupConsumer {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn poll(&mut self, timeout: Duration) -> BrokerResult<Option<ConsumedRecord>> {
        let deadline = Instant::now() + timeout;
        let inner = self.broker.inner.clone();

        loop {
            let changed = inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(record) = self.try_next()? {
                return Ok(Some(record));
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, record: &ConsumedRecord) -> BrokerResult<()> {
        let mut state = self.broker.lock();
        state.ensure_reachable()?;

        let group = state
            .groups
            .get_mut(&self.group_id)
            .ok_or_else(|| BrokerError::NotMember(self.group_id.clone()))?;
        let owned = group
            .members
            .get(&self.member_id)
            .ok_or_else(|| BrokerError::NotMember(self.group_id.clone()))?;
        if !owned.contains(&record.partition) {
            return Err(BrokerError::NotAssigned {
                group_id: self.group_id.clone(),
                partition: record.partition,
            });
        }

        group.committed.insert(record.partition, record.offset + 1);
        Ok(())
    }

    async fn rewind(&mut self, record: &ConsumedRecord) -> BrokerResult<()> {
        if self.assigned.contains(&record.partition) {
            self.positions.insert(record.partition, record.offset);
        }
        Ok(())
    }

    fn assignment(&self) -> Vec<u32> {
        self.broker
            .lock()
            .groups
            .get(&self.group_id)
            .and_then(|g| g.members.get(&self.member_id).cloned())
            .unwrap_or_default()
    }

    async fn leave(mut self: Box<Self>) -> BrokerResult<()> {
        self.left = true;
        self.broker.remove_member(&self.group_id, self.member_id);
        Ok(())
    }
}

impl Drop for MemoryGroupConsumer {
    fn drop(&mut self) {
        // A dropped member behaves like one whose session expired.
        if !self.left {
            self.broker.remove_member(&self.group_id, self.member_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str, partitions: u32) -> NewTopic {
        NewTopic {
            name: name.to_string(),
            partitions,
            replication_factor: 1,
        }
    }

    fn record(topic: &str, partition: u32, key: &str) -> OutboundRecord {
        OutboundRecord {
            topic: topic.to_string(),
            partition,
            key: Some(key.to_string()),
            payload: key.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_create_topics_reports_conflicts() {
        let broker = MemoryBroker::new();
        broker.create_topics(&[topic("file.uploaded", 3)]).await.unwrap();

        let err = broker
            .create_topics(&[topic("file.uploaded", 3), topic("file.deleted", 2)])
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::TopicAlreadyExists("file.uploaded".to_string()));
        assert_eq!(broker.topic_names(), vec!["file.deleted", "file.uploaded"]);
        assert_eq!(broker.create_topic_requests(), 2);
    }

    #[tokio::test]
    async fn test_raced_create_still_creates_topics() {
        let broker = MemoryBroker::new();
        broker.race_next_create();

        let err = broker
            .create_topics(&[topic("file.uploaded", 3), topic("file.deleted", 2)])
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::TopicAlreadyExists("file.uploaded".to_string()));
        assert_eq!(broker.topic_names(), vec!["file.deleted", "file.uploaded"]);

        // the hook applies once
        broker.create_topics(&[topic("file.shared", 1)]).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_appends_offsets() {
        let broker = MemoryBroker::new();
        broker.create_topics(&[topic("file.uploaded", 2)]).await.unwrap();

        let first = broker.send(record("file.uploaded", 1, "a")).await.unwrap();
        let second = broker.send(record("file.uploaded", 1, "b")).await.unwrap();
        assert_eq!(first, RecordMetadata { partition: 1, offset: 0 });
        assert_eq!(second, RecordMetadata { partition: 1, offset: 1 });

        let err = broker.send(record("file.uploaded", 5, "c")).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownPartition { partition: 5, .. }));
        let err = broker.send(record("file.missing", 0, "c")).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTopic(_)));
    }

    #[tokio::test]
    async fn test_range_assignment() {
        let broker = MemoryBroker::new();
        broker.create_topics(&[topic("file.uploaded", 6)]).await.unwrap();

        let a = broker.join_group("g", "file.uploaded").await.unwrap();
        assert_eq!(a.assignment(), vec![0, 1, 2, 3, 4, 5]);

        let b = broker.join_group("g", "file.uploaded").await.unwrap();
        let c = broker.join_group("g", "file.uploaded").await.unwrap();
        let d = broker.join_group("g", "file.uploaded").await.unwrap();
        assert_eq!(a.assignment(), vec![0, 1]);
        assert_eq!(b.assignment(), vec![2, 3]);
        assert_eq!(c.assignment(), vec![4]);
        assert_eq!(d.assignment(), vec![5]);

        b.leave().await.unwrap();
        assert_eq!(a.assignment(), vec![0, 1]);
        assert_eq!(c.assignment(), vec![2, 3]);
        assert_eq!(d.assignment(), vec![4, 5]);

        drop(c);
        assert_eq!(broker.group_assignment("g").len(), 2);
    }

    #[tokio::test]
    async fn test_poll_commit_and_resume() {
        let broker = MemoryBroker::new();
        broker.create_topics(&[topic("file.uploaded", 1)]).await.unwrap();
        for key in ["a", "b", "c"] {
            broker.send(record("file.uploaded", 0, key)).await.unwrap();
        }

        let mut consumer = broker.join_group("g", "file.uploaded").await.unwrap();
        let timeout = Duration::from_millis(50);

        let first = consumer.poll(timeout).await.unwrap().unwrap();
        assert_eq!(first.offset, 0);
        consumer.commit(&first).await.unwrap();

        let second = consumer.poll(timeout).await.unwrap().unwrap();
        assert_eq!(second.key.as_deref(), Some("b"));

        // rewind redelivers the same record
        consumer.rewind(&second).await.unwrap();
        let again = consumer.poll(timeout).await.unwrap().unwrap();
        assert_eq!(again.offset, 1);
        assert_eq!(broker.committed_offset("g", 0), Some(1));

        // a fresh member resumes from the committed offset, not from the local position
        consumer.leave().await.unwrap();
        let mut replacement = broker.join_group("g", "file.uploaded").await.unwrap();
        let resumed = replacement.poll(timeout).await.unwrap().unwrap();
        assert_eq!(resumed.offset, 1);
    }

    #[tokio::test]
    async fn test_poll_waits_for_new_records() {
        let broker = MemoryBroker::new();
        broker.create_topics(&[topic("file.uploaded", 1)]).await.unwrap();
        let mut consumer = broker.join_group("g", "file.uploaded").await.unwrap();

        assert!(consumer.poll(Duration::from_millis(10)).await.unwrap().is_none());

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.send(record("file.uploaded", 0, "late")).await.unwrap();
        });

        let polled = consumer.poll(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(polled.key.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        assert!(matches!(broker.connect().await, Err(BrokerError::Unreachable(_))));
        assert!(matches!(broker.list_topics().await, Err(BrokerError::Unreachable(_))));

        broker.set_reachable(true);
        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }
}
