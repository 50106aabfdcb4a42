/// Store-and-forward delivery with two acknowledgment stages
///
/// A queue entry is published, moves to "awaiting downstream" when the broker
/// completes the exactly-once handshake, and is deleted only once the
/// receiving side echoes its name on the acknowledgment topic. A dropped
/// connection forgets all tracking; the entries are still on storage and are
/// simply published again.
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};

use crate::delivery::{BrokerEvent, BrokerTransport, MessageId};
use crate::models::ConfigurationDescriptor;
use crate::network::NetworkStatus;
use crate::storage::{DurableQueue, EntryName, Storage};

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub measurements_topic: String,
    pub configuration_topic: String,
    pub ack_topic: String,
    pub descriptor: ConfigurationDescriptor,
    /// Wait before a deferred entry is tried again
    pub retry_delay: Duration,
    /// Pause between worker iterations
    pub worker_pause: Duration,
}

/// Result of one worker pass over a queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Published(MessageId),
    /// Try again later under this (possibly renamed) name
    Deferred(String),
    /// Not a deliverable entry
    Dropped,
}

#[derive(Default)]
struct Schedule {
    queue: VecDeque<String>,
    /// Every name the worker still owns: queued, being processed or deferred
    scheduled: HashSet<String>,
}

/// Names waiting for the worker, each scheduled at most once
#[derive(Default)]
struct PendingFiles {
    schedule: Mutex<Schedule>,
    ready: Notify,
}

impl PendingFiles {
    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a name unless the worker already owns it
    fn push(&self, name: String) {
        {
            let mut schedule = self.schedule();
            if !schedule.scheduled.insert(name.clone()) {
                return;
            }
            schedule.queue.push_back(name);
        }
        self.ready.notify_one();
    }

    /// Queue a deferred name again; it stayed scheduled while it waited
    fn resume(&self, name: String) {
        {
            let mut schedule = self.schedule();
            schedule.scheduled.insert(name.clone());
            if schedule.queue.contains(&name) {
                return;
            }
            schedule.queue.push_back(name);
        }
        self.ready.notify_one();
    }

    /// Keep ownership across a deferral, following a rename
    ///
    /// Returns false when the new name is already scheduled elsewhere.
    fn carry_over(&self, old: &str, new: &str) -> bool {
        if old == new {
            return true;
        }
        let mut schedule = self.schedule();
        schedule.scheduled.remove(old);
        schedule.scheduled.insert(new.to_string())
    }

    fn finish(&self, name: &str) {
        self.schedule().scheduled.remove(name);
    }

    fn pop(&self) -> Option<String> {
        self.schedule().queue.pop_front()
    }

    async fn next(&self) -> String {
        loop {
            if let Some(name) = self.pop() {
                return name;
            }
            self.ready.notified().await;
        }
    }
}

#[derive(Debug, Default)]
struct Tracking {
    /// Published, waiting for the broker
    in_flight: HashMap<MessageId, String>,
    /// Broker has it, waiting for the downstream confirmation
    awaiting: HashSet<String>,
    /// Downstream confirmation that overtook the broker ack
    confirmed_early: HashSet<String>,
}

impl Tracking {
    fn is_in_flight(&self, name: &str) -> bool {
        self.in_flight.values().any(|n| n == name)
    }

    fn contains(&self, name: &str) -> bool {
        self.is_in_flight(name) || self.awaiting.contains(name)
    }

    fn drain(&mut self) -> Vec<String> {
        let mut names: Vec<String> = self.in_flight.drain().map(|(_, name)| name).collect();
        names.extend(self.awaiting.drain());
        self.confirmed_early.clear();
        names
    }
}

pub struct DeliveryPipeline<S, B> {
    queue: Arc<DurableQueue<S>>,
    broker: Arc<B>,
    network: Arc<NetworkStatus>,
    config: DeliveryConfig,
    pending: PendingFiles,
    tracking: Mutex<Tracking>,
}

impl<S, B> DeliveryPipeline<S, B>
where
    S: Storage + 'static,
    B: BrokerTransport + 'static,
{
    pub fn new(
        queue: Arc<DurableQueue<S>>,
        broker: Arc<B>,
        network: Arc<NetworkStatus>,
        config: DeliveryConfig,
    ) -> Self {
        DeliveryPipeline {
            queue,
            broker,
            network,
            config,
            pending: PendingFiles::default(),
            tracking: Mutex::new(Tracking::default()),
        }
    }

    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand an entry to the worker
    pub fn submit(&self, name: String) {
        self.pending.push(name);
    }

    /// Queue every entry currently on storage
    pub fn seed_from_storage(&self) -> usize {
        let names = self.queue.list();
        let count = names.len();
        for name in names {
            self.submit(name);
        }
        if count > 0 {
            info!("{} stored record(s) queued for delivery", count);
        }
        count
    }

    /// One worker pass over `name`
    pub fn process(&self, name: &str) -> Outcome {
        let entry = match EntryName::parse(name) {
            Some(entry) => entry,
            None => {
                debug!("Skipping administrative entry {}", name);
                return Outcome::Dropped;
            }
        };
        if !self.queue.is_available() {
            return Outcome::Deferred(name.to_string());
        }

        let name = if entry.synchronized {
            name.to_string()
        } else {
            match self.queue.rename_if_synchronized(name) {
                Some(renamed) => renamed,
                None if self.queue.contains(name) => return Outcome::Deferred(name.to_string()),
                None => return Outcome::Dropped,
            }
        };

        if self.tracking().contains(&name) {
            return Outcome::Deferred(name);
        }
        if !self.broker.is_connected() || !self.network.is_up() {
            return Outcome::Deferred(name);
        }

        let payload = match self.queue.read(&name) {
            Some(payload) => payload,
            None if self.queue.contains(&name) => return Outcome::Deferred(name),
            None => {
                debug!("{} is gone, nothing to publish", name);
                return Outcome::Dropped;
            }
        };

        // The broker ack may arrive as soon as publish returns
        let mut tracking = self.tracking();
        match self.broker.publish(&self.config.measurements_topic, payload) {
            Ok(id) => {
                debug!("Published {} as {}", name, id);
                tracking.in_flight.insert(id, name);
                Outcome::Published(id)
            }
            Err(e) => {
                warn!("Publish of {} failed: {}", name, e);
                Outcome::Deferred(name)
            }
        }
    }

    fn defer(self: &Arc<Self>, name: String) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            sleep(pipeline.config.retry_delay).await;
            pipeline.pending.resume(name);
        });
    }

    /// Process one popped name and settle its place in the schedule
    fn work_on(self: &Arc<Self>, name: &str) -> Outcome {
        let outcome = self.process(name);
        match &outcome {
            Outcome::Deferred(next) => {
                if self.pending.carry_over(name, next) {
                    self.defer(next.clone());
                }
            }
            _ => self.pending.finish(name),
        }
        outcome
    }

    pub async fn run_worker(self: Arc<Self>) {
        loop {
            let name = self.pending.next().await;
            self.work_on(&name);
            sleep(self.config.worker_pause).await;
        }
    }

    fn on_connected(&self) {
        if let Err(e) = self.broker.subscribe(&self.config.ack_topic) {
            error!("Subscribe to {} failed: {}", self.config.ack_topic, e);
        }
        match serde_json::to_vec(&self.config.descriptor) {
            Ok(descriptor) => {
                if let Err(e) = self.broker.publish(&self.config.configuration_topic, descriptor) {
                    warn!("Configuration publish failed: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize configuration: {}", e),
        }
        self.seed_from_storage();
    }

    fn on_broker_ack(&self, id: MessageId) {
        let mut tracking = self.tracking();
        let name = match tracking.in_flight.remove(&id) {
            Some(name) => name,
            None => return,
        };
        if tracking.confirmed_early.remove(&name) {
            drop(tracking);
            self.remove_delivered(name);
        } else {
            debug!("{} received by broker, awaiting confirmation", name);
            tracking.awaiting.insert(name);
        }
    }

    /// Delete a fully acknowledged entry
    ///
    /// A file that cannot be deleted goes back to the worker; it may be
    /// published once more and confirmed again.
    fn remove_delivered(&self, name: String) {
        if self.queue.delete(&name) {
            info!("{} delivered", name);
        } else {
            warn!("{} delivered but not deleted, resubmitting", name);
            self.submit(name);
        }
    }

    fn on_downstream_ack(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        let name = text.trim();
        let mut tracking = self.tracking();
        if tracking.awaiting.remove(name) {
            drop(tracking);
            self.remove_delivered(name.to_string());
        } else if tracking.is_in_flight(name) {
            tracking.confirmed_early.insert(name.to_string());
        } else {
            debug!("Ignoring confirmation for unknown entry {}", name);
        }
    }

    fn on_connection_closed(&self) {
        let names = self.tracking().drain();
        if !names.is_empty() {
            info!("{} unacknowledged record(s) will be republished", names.len());
        }
        for name in names {
            self.submit(name);
        }
    }

    pub fn handle_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => self.on_connected(),
            BrokerEvent::Acked(id) => self.on_broker_ack(id),
            BrokerEvent::Message { topic, payload } => {
                if topic == self.config.ack_topic {
                    self.on_downstream_ack(&payload);
                }
            }
            BrokerEvent::ConnectionClosed => self.on_connection_closed(),
        }
    }

    pub async fn run_events(self: Arc<Self>, mut events: UnboundedReceiver<BrokerEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockSync;
    use crate::delivery::BrokerError;
    use crate::storage::queue::tests::{queue_in, record, CAPTURE_TICKS};
    use crate::storage::FsStorage;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeBroker {
        connected: AtomicBool,
        reject: AtomicBool,
        next_id: AtomicU64,
        published: Mutex<Vec<(String, Vec<u8>)>>,
        subscriptions: Mutex<Vec<String>>,
    }

    impl FakeBroker {
        fn connected() -> Self {
            let broker = FakeBroker::default();
            broker.connected.store(true, Ordering::SeqCst);
            broker
        }

        fn published_topics(&self) -> Vec<String> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(topic, _)| topic.clone())
                .collect()
        }
    }

    impl BrokerTransport for FakeBroker {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<MessageId, BrokerError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(BrokerError::Rejected("request queue full".to_string()));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)))
        }

        fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
            self.subscriptions.lock().unwrap().push(topic.to_string());
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        clock: Arc<ClockSync>,
        queue: Arc<DurableQueue<FsStorage>>,
        broker: Arc<FakeBroker>,
        network: Arc<NetworkStatus>,
        pipeline: Arc<DeliveryPipeline<FsStorage, FakeBroker>>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ClockSync::new());
        let queue = Arc::new(queue_in(&dir, Arc::clone(&clock)));
        let broker = Arc::new(FakeBroker::connected());
        let network = Arc::new(NetworkStatus::new(true));
        let config = DeliveryConfig {
            measurements_topic: "FEZ_49/measurements".to_string(),
            configuration_topic: "FEZ_49/configuration".to_string(),
            ack_topic: "FEZ_49/acks".to_string(),
            descriptor: ConfigurationDescriptor::new("FEZ_49", "Fissure", "FEZ_49", "fissure"),
            retry_delay: Duration::from_millis(20),
            worker_pause: Duration::from_millis(1),
        };
        let pipeline = Arc::new(DeliveryPipeline::new(
            Arc::clone(&queue),
            Arc::clone(&broker),
            Arc::clone(&network),
            config,
        ));
        Fixture {
            dir,
            clock,
            queue,
            broker,
            network,
            pipeline,
        }
    }

    fn downstream_ack(name: &str) -> BrokerEvent {
        BrokerEvent::Message {
            topic: "FEZ_49/acks".to_string(),
            payload: name.as_bytes().to_vec(),
        }
    }

    fn published(outcome: Outcome) -> MessageId {
        match outcome {
            Outcome::Published(id) => id,
            other => panic!("expected a publish, got {:?}", other),
        }
    }

    #[test]
    fn both_acks_delete_the_entry() {
        let f = fixture();
        let name = f.queue.enqueue(&record(CAPTURE_TICKS, true)).unwrap();

        let id = published(f.pipeline.process(&name));
        assert_eq!(f.pipeline.tracking().in_flight.get(&id), Some(&name));
        assert_eq!(f.broker.published_topics(), vec!["FEZ_49/measurements"]);

        f.pipeline.handle_event(BrokerEvent::Acked(id));
        assert!(f.pipeline.tracking().in_flight.is_empty());
        assert!(f.pipeline.tracking().awaiting.contains(&name));
        assert!(f.queue.contains(&name));

        f.pipeline.handle_event(downstream_ack(&name));
        assert!(!f.queue.contains(&name));
        assert!(f.pipeline.tracking().awaiting.is_empty());
    }

    #[test]
    fn connection_closed_keeps_entry_and_republishes() {
        let f = fixture();
        let name = f.queue.enqueue(&record(CAPTURE_TICKS, true)).unwrap();
        let first = published(f.pipeline.process(&name));

        f.pipeline.handle_event(BrokerEvent::ConnectionClosed);

        assert!(f.pipeline.tracking().in_flight.is_empty());
        assert!(f.queue.contains(&name));
        assert_eq!(f.pipeline.pending.pop(), Some(name.clone()));

        // A late ack for the old session changes nothing
        f.pipeline.handle_event(BrokerEvent::Acked(first));
        assert!(f.pipeline.tracking().awaiting.is_empty());

        let second = published(f.pipeline.process(&name));
        assert_ne!(first, second);
        assert_eq!(f.broker.published_topics().len(), 2);
    }

    #[test]
    fn closing_while_awaiting_downstream_resubmits() {
        let f = fixture();
        let name = f.queue.enqueue(&record(CAPTURE_TICKS, true)).unwrap();
        let id = published(f.pipeline.process(&name));
        f.pipeline.handle_event(BrokerEvent::Acked(id));

        f.pipeline.handle_event(BrokerEvent::ConnectionClosed);

        assert!(f.pipeline.tracking().awaiting.is_empty());
        assert_eq!(f.pipeline.pending.pop(), Some(name.clone()));
        assert!(f.queue.contains(&name));
    }

    #[test]
    fn early_downstream_ack_waits_for_broker_ack() {
        let f = fixture();
        let name = f.queue.enqueue(&record(CAPTURE_TICKS, true)).unwrap();
        let id = published(f.pipeline.process(&name));

        f.pipeline.handle_event(downstream_ack(&name));
        assert!(f.queue.contains(&name));

        f.pipeline.handle_event(BrokerEvent::Acked(id));
        assert!(!f.queue.contains(&name));
        let tracking = f.pipeline.tracking();
        assert!(tracking.awaiting.is_empty());
        assert!(tracking.confirmed_early.is_empty());
    }

    #[test]
    fn unknown_or_foreign_acks_are_ignored() {
        let f = fixture();
        let name = f.queue.enqueue(&record(CAPTURE_TICKS, true)).unwrap();

        f.pipeline.handle_event(downstream_ack(&name));
        f.pipeline.handle_event(BrokerEvent::Message {
            topic: "other/topic".to_string(),
            payload: name.as_bytes().to_vec(),
        });
        f.pipeline.handle_event(BrokerEvent::Acked(MessageId(99)));

        assert!(f.queue.contains(&name));
    }

    #[test]
    fn tracked_entries_are_not_published_twice() {
        let f = fixture();
        let name = f.queue.enqueue(&record(CAPTURE_TICKS, true)).unwrap();
        published(f.pipeline.process(&name));

        assert_eq!(f.pipeline.process(&name), Outcome::Deferred(name.clone()));
        assert_eq!(f.broker.published_topics().len(), 1);
    }

    #[test]
    fn no_transport_means_deferral() {
        let f = fixture();
        let name = f.queue.enqueue(&record(CAPTURE_TICKS, true)).unwrap();

        f.broker.connected.store(false, Ordering::SeqCst);
        assert_eq!(f.pipeline.process(&name), Outcome::Deferred(name.clone()));

        f.broker.connected.store(true, Ordering::SeqCst);
        f.network.set(false);
        assert_eq!(f.pipeline.process(&name), Outcome::Deferred(name.clone()));

        f.network.set(true);
        f.broker.reject.store(true, Ordering::SeqCst);
        assert_eq!(f.pipeline.process(&name), Outcome::Deferred(name.clone()));
        assert!(f.pipeline.tracking().in_flight.is_empty());
        assert!(f.queue.contains(&name));
    }

    #[test]
    fn administrative_and_missing_entries_are_dropped() {
        let f = fixture();
        assert_eq!(f.pipeline.process("config"), Outcome::Dropped);
        assert_eq!(f.pipeline.process("12345"), Outcome::Dropped);
        assert_eq!(f.pipeline.process("12345_notSynch"), Outcome::Dropped);
        assert!(f.broker.published_topics().is_empty());
    }

    #[test]
    fn unsynchronized_entry_waits_for_clock_then_publishes_renamed() {
        let f = fixture();
        let name = f.queue.enqueue(&record(1_000, false)).unwrap();

        assert_eq!(f.pipeline.process(&name), Outcome::Deferred(name.clone()));
        assert!(f.broker.published_topics().is_empty());

        f.clock.mark_synchronized(CAPTURE_TICKS - 1_000);
        published(f.pipeline.process(&name));

        let renamed = CAPTURE_TICKS.to_string();
        assert_eq!(f.queue.list(), vec![renamed.clone()]);
        assert!(f.pipeline.tracking().is_in_flight(&renamed));
    }

    #[test]
    fn connecting_subscribes_announces_and_seeds() {
        let f = fixture();
        let name = f.queue.enqueue(&record(CAPTURE_TICKS, true)).unwrap();

        f.pipeline.handle_event(BrokerEvent::Connected);

        assert_eq!(*f.broker.subscriptions.lock().unwrap(), vec!["FEZ_49/acks"]);
        let published = f.broker.published.lock().unwrap();
        assert_eq!(published[0].0, "FEZ_49/configuration");
        let descriptor: ConfigurationDescriptor = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(descriptor.sensors.len(), 5);
        drop(published);

        assert_eq!(f.pipeline.pending.pop(), Some(name));
        assert_eq!(f.pipeline.pending.pop(), None);
    }

    #[test]
    fn undeletable_confirmed_entry_goes_back_to_the_worker() {
        let f = fixture();
        let name = f.queue.enqueue(&record(CAPTURE_TICKS, true)).unwrap();
        let id = published(f.pipeline.process(&name));
        f.pipeline.handle_event(BrokerEvent::Acked(id));
        std::fs::remove_file(f.dir.path().join(format!("{}.json", name))).unwrap();

        f.pipeline.handle_event(downstream_ack(&name));

        assert!(f.pipeline.tracking().awaiting.is_empty());
        assert_eq!(f.pipeline.pending.pop(), Some(name.clone()));
        assert_eq!(f.pipeline.process(&name), Outcome::Dropped);
    }

    #[tokio::test]
    async fn reconnects_do_not_duplicate_a_deferred_entry() {
        let f = fixture();
        f.broker.connected.store(false, Ordering::SeqCst);
        let name = f.queue.enqueue(&record(CAPTURE_TICKS, true)).unwrap();
        f.pipeline.submit(name.clone());

        let popped = f.pipeline.pending.pop().unwrap();
        assert_eq!(f.pipeline.work_on(&popped), Outcome::Deferred(name.clone()));

        // Flapping broker while the deferral sleeps
        for _ in 0..30 {
            f.pipeline.handle_event(BrokerEvent::Connected);
            f.pipeline.handle_event(BrokerEvent::ConnectionClosed);
        }
        assert_eq!(f.pipeline.pending.pop(), None);

        sleep(Duration::from_millis(80)).await;
        assert_eq!(f.pipeline.pending.pop(), Some(name.clone()));
        assert_eq!(f.pipeline.pending.pop(), None);

        // Once published the name is released, so a reset can resubmit it
        f.broker.connected.store(true, Ordering::SeqCst);
        published(f.pipeline.work_on(&name));
        f.pipeline.handle_event(BrokerEvent::ConnectionClosed);
        assert_eq!(f.pipeline.pending.pop(), Some(name));
    }

    #[tokio::test]
    async fn renamed_deferral_is_scheduled_under_the_new_name() {
        let f = fixture();
        f.broker.connected.store(false, Ordering::SeqCst);
        f.clock.mark_synchronized(CAPTURE_TICKS - 1_000);
        let old = f.queue.enqueue(&record(1_000, false)).unwrap();
        f.pipeline.submit(old.clone());

        let popped = f.pipeline.pending.pop().unwrap();
        let renamed = CAPTURE_TICKS.to_string();
        assert_eq!(f.pipeline.work_on(&popped), Outcome::Deferred(renamed.clone()));

        f.pipeline.seed_from_storage();
        assert_eq!(f.pipeline.pending.pop(), None);
        f.pipeline.submit(old.clone());
        assert_eq!(f.pipeline.pending.pop(), Some(old));
    }

    #[test]
    fn pending_names_are_deduplicated() {
        let f = fixture();
        f.pipeline.submit("1".to_string());
        f.pipeline.submit("1".to_string());
        f.pipeline.submit("2".to_string());

        assert_eq!(f.pipeline.pending.pop().as_deref(), Some("1"));
        assert_eq!(f.pipeline.pending.pop().as_deref(), Some("2"));
        assert_eq!(f.pipeline.pending.pop(), None);
    }

    #[tokio::test]
    async fn worker_retries_until_the_broker_is_back() {
        let f = fixture();
        f.broker.connected.store(false, Ordering::SeqCst);
        let name = f.queue.enqueue(&record(CAPTURE_TICKS, true)).unwrap();
        f.pipeline.submit(name.clone());
        let worker = tokio::spawn(Arc::clone(&f.pipeline).run_worker());

        sleep(Duration::from_millis(50)).await;
        assert!(f.broker.published_topics().is_empty());

        f.broker.connected.store(true, Ordering::SeqCst);
        let mut delivered = false;
        for _ in 0..100 {
            if f.pipeline.tracking().is_in_flight(&name) {
                delivered = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        worker.abort();

        assert!(delivered);
        assert_eq!(f.broker.published_topics(), vec!["FEZ_49/measurements"]);
    }
}
