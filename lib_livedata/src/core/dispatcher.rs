//! # Broadcast Dispatcher
//!
//! The `Dispatcher` is the single entry point for live data. Any thread may
//! call [`Dispatcher::broadcast`]; the call never blocks. One dedicated
//! dispatcher thread drains the queue in FIFO order and hands every event to
//! the registered [`BdxListener`]s, which gives the whole engine a total order
//! over events and guarantees that no two list mutations ever run
//! concurrently.
//!
//! ## Delivery
//!
//! 1.  **Substitution**: an [`Broadcast::Envelope`] is replaced by the
//!     broadcast value it derives before anything else sees it.
//! 2.  **Class listeners**: listeners registered for the event's exact class.
//! 3.  **Catch-all listeners**: listeners registered with no class.
//!
//! A listener that returns an error or panics is logged by name and skipped;
//! the remaining listeners and all later events are still delivered.
//!
//! ## Clock pulse
//!
//! [`Dispatcher::start_clock`] injects a [`ClockPulse`] once per period through
//! the same queue, so time-driven consumers observe pulses in order with data.
//!
//! ## Shutdown
//!
//! [`Dispatcher::stop`] raises a stop flag and pushes a sentinel so the blocked
//! dispatcher thread wakes immediately.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::queue_guard::QueueGuard;
use crate::core::types::{Item, TypeTag, CLOCK_PULSE};

/// Periodic time signal.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockPulse {
    /// Wall-clock time the pulse was produced.
    pub at: DateTime<Utc>,
    /// Monotonic pulse counter, starting at 1.
    pub sequence: u64,
}

/// A non class-keyed payload matched by tag name (tree and list-tree
/// definitions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedDefinition {
    /// Tag name, looked up in the router's tag table.
    pub tag: String,
    /// The definition body.
    pub body: Value,
}

/// A domain object that is broadcast as a value derived from it.
pub trait Envelope: Send + Sync + fmt::Debug {
    /// The event actually delivered to listeners.
    fn broadcast_value(&self) -> Broadcast;
}

/// # Broadcast Event
///
/// Everything that travels through the queue.
#[derive(Debug, Clone)]
pub enum Broadcast {
    /// Insert-or-update of a domain item.
    Item(Item),
    /// Removal of a domain item (matched by key).
    Remove(Item),
    /// Removal of every item of a class.
    Clear(TypeTag),
    /// Clock pulse.
    Pulse(ClockPulse),
    /// Tree or list-tree definition.
    Definition(TaggedDefinition),
    /// Object substituted by its broadcast value at dispatch time.
    Envelope(Arc<dyn Envelope>),
    /// Shutdown sentinel.
    Stop,
}

impl Broadcast {
    /// Runtime class used for listener lookup.
    pub fn class(&self) -> TypeTag {
        match self {
            Broadcast::Item(item) | Broadcast::Remove(item) => item.type_tag().clone(),
            Broadcast::Clear(tag) => tag.clone(),
            Broadcast::Pulse(_) => TypeTag::new(CLOCK_PULSE),
            Broadcast::Definition(def) => TypeTag::new(&def.tag),
            Broadcast::Envelope(_) => TypeTag::new("Envelope"),
            Broadcast::Stop => TypeTag::new("Stop"),
        }
    }

    /// Applies broadcast-value substitution.
    pub fn resolve(self) -> Broadcast {
        match self {
            Broadcast::Envelope(envelope) => envelope.broadcast_value(),
            other => other,
        }
    }
}

/// Errors raised by the dispatcher or reported by listeners.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher no longer accepts events.
    #[error("dispatcher is stopped")]
    Stopped,
    /// `start` was called twice.
    #[error("dispatcher already started")]
    AlreadyStarted,
    /// The dispatcher thread could not be spawned.
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// A listener could not handle an event.
    #[error("{0}")]
    Listener(String),
}

/// Receiver of broadcast events.
pub trait BdxListener: Send + Sync {
    /// Identity used in logs and for removal.
    fn name(&self) -> String;
    /// Handles one event on the dispatcher thread.
    fn on_broadcast(&self, event: &Broadcast) -> Result<(), DispatchError>;
}

/// # Dispatcher
///
/// See the module documentation.
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<Broadcast>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Broadcast>>>,
    guard: QueueGuard,
    by_class: Mutex<HashMap<TypeTag, Vec<Arc<dyn BdxListener>>>>,
    catch_all: Mutex<Vec<Arc<dyn BdxListener>>>,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    clock: Mutex<Option<CancellationToken>>,
}

impl Dispatcher {
    /// Creates a dispatcher whose queue warns above `high_water` pending events.
    pub fn new(high_water: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            guard: QueueGuard::new(high_water),
            by_class: Mutex::new(HashMap::new()),
            catch_all: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            worker: Mutex::new(None),
            clock: Mutex::new(None),
        })
    }

    /// # Broadcast
    ///
    /// Enqueues `event` for the dispatcher thread. Never blocks. Events may be
    /// enqueued before [`Dispatcher::start`]; they are delivered once it runs.
    pub fn broadcast(&self, event: Broadcast) -> Result<(), DispatchError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DispatchError::Stopped);
        }
        self.guard.increment();
        self.sender.send(event).map_err(|_| {
            self.guard.decrement();
            DispatchError::Stopped
        })
    }

    /// Number of events waiting in the queue.
    pub fn queue_length(&self) -> usize {
        self.guard.len()
    }

    /// The queue guard, for monitoring.
    pub fn queue_guard(&self) -> &QueueGuard {
        &self.guard
    }

    /// Registers `listener` for the given classes, or for everything when
    /// `classes` is empty.
    pub fn add_listener(&self, listener: Arc<dyn BdxListener>, classes: &[TypeTag]) {
        if classes.is_empty() {
            self.catch_all
                .lock()
                .expect("Dispatcher lock poisoned")
                .push(listener);
            return;
        }
        let mut by_class = self.by_class.lock().expect("Dispatcher lock poisoned");
        for class in classes {
            by_class
                .entry(class.clone())
                .or_default()
                .push(Arc::clone(&listener));
        }
    }

    /// Removes every registration of the listener called `name`.
    pub fn remove_listener(&self, name: &str) -> bool {
        let mut removed = false;
        {
            let mut by_class = self.by_class.lock().expect("Dispatcher lock poisoned");
            for listeners in by_class.values_mut() {
                let before = listeners.len();
                listeners.retain(|l| l.name() != name);
                removed |= before != listeners.len();
            }
            by_class.retain(|_, listeners| !listeners.is_empty());
        }
        let mut catch_all = self.catch_all.lock().expect("Dispatcher lock poisoned");
        let before = catch_all.len();
        catch_all.retain(|l| l.name() != name);
        removed | (before != catch_all.len())
    }

    /// # Notify
    ///
    /// Delivers one event synchronously on the calling thread. The dispatcher
    /// thread uses this for every dequeued event.
    pub fn notify(&self, event: Broadcast) {
        let event = event.resolve();
        let class = event.class();

        let exact: Vec<Arc<dyn BdxListener>> = self
            .by_class
            .lock()
            .expect("Dispatcher lock poisoned")
            .get(&class)
            .cloned()
            .unwrap_or_default();
        for listener in &exact {
            Self::deliver(listener, &class, &event);
        }

        let catch_all: Vec<Arc<dyn BdxListener>> = self
            .catch_all
            .lock()
            .expect("Dispatcher lock poisoned")
            .clone();
        for listener in &catch_all {
            Self::deliver(listener, &class, &event);
        }
    }

    fn deliver(listener: &Arc<dyn BdxListener>, class: &TypeTag, event: &Broadcast) {
        match catch_unwind(AssertUnwindSafe(|| listener.on_broadcast(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!(
                "Broadcast listener '{}' failed on {}: {}",
                listener.name(),
                class,
                e
            ),
            Err(_) => log::error!(
                "Broadcast listener '{}' panicked on {}",
                listener.name(),
                class
            ),
        }
    }

    /// # Start
    ///
    /// Spawns the dispatcher thread.
    pub fn start(self: &Arc<Self>) -> Result<(), DispatchError> {
        let mut receiver = self
            .receiver
            .lock()
            .expect("Dispatcher lock poisoned")
            .take()
            .ok_or(DispatchError::AlreadyStarted)?;
        let dispatcher = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("bdx-dispatcher".to_string())
            .spawn(move || {
                log::info!("Dispatcher thread started.");
                while let Some(event) = receiver.blocking_recv() {
                    if matches!(event, Broadcast::Stop) || dispatcher.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    dispatcher.guard.decrement();
                    dispatcher.notify(event);
                }
                log::info!("Dispatcher thread stopped.");
            })?;
        *self.worker.lock().expect("Dispatcher lock poisoned") = Some(handle);
        Ok(())
    }

    /// Injects a [`ClockPulse`] every `period` on the given runtime until
    /// [`Dispatcher::stop`].
    pub fn start_clock(self: &Arc<Self>, handle: &Handle, period: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .clock
            .lock()
            .expect("Dispatcher lock poisoned")
            .replace(token.clone())
        {
            previous.cancel();
        }
        let dispatcher = Arc::clone(self);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            let mut sequence = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        sequence += 1;
                        let pulse = ClockPulse { at: Utc::now(), sequence };
                        if dispatcher.broadcast(Broadcast::Pulse(pulse)).is_err() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Clock pulse stopped after {} pulses", sequence);
        });
    }

    /// Whether [`Dispatcher::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// # Stop
    ///
    /// Rejects further events, cancels the clock, wakes the dispatcher thread
    /// with the sentinel and waits for it to exit.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.clock.lock().expect("Dispatcher lock poisoned").take() {
            token.cancel();
        }
        let _ = self.sender.send(Broadcast::Stop);
        if let Some(handle) = self.worker.lock().expect("Dispatcher lock poisoned").take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("Dispatcher thread terminated abnormally.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Record;
    use std::sync::mpsc as std_mpsc;

    struct Collector {
        name: String,
        seen: Mutex<Vec<String>>,
        done: Mutex<Option<std_mpsc::Sender<()>>>,
        expect: usize,
    }

    impl Collector {
        fn new(name: &str, expect: usize) -> (Arc<Self>, std_mpsc::Receiver<()>) {
            let (tx, rx) = std_mpsc::channel();
            (
                Arc::new(Self {
                    name: name.into(),
                    seen: Mutex::new(Vec::new()),
                    done: Mutex::new(Some(tx)),
                    expect,
                }),
                rx,
            )
        }
    }

    impl BdxListener for Collector {
        fn name(&self) -> String {
            self.name.clone()
        }
        fn on_broadcast(&self, event: &Broadcast) -> Result<(), DispatchError> {
            if let Broadcast::Item(item) = event {
                let id = item.attribute("id").and_then(|v| v.as_str().map(String::from));
                let mut seen = self.seen.lock().unwrap();
                seen.push(id.unwrap_or_default());
                if seen.len() == self.expect {
                    if let Some(tx) = self.done.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                }
            }
            Ok(())
        }
    }

    struct Failing;

    impl BdxListener for Failing {
        fn name(&self) -> String {
            "failing".into()
        }
        fn on_broadcast(&self, _event: &Broadcast) -> Result<(), DispatchError> {
            Err(DispatchError::Listener("boom".into()))
        }
    }

    struct Panicking;

    impl BdxListener for Panicking {
        fn name(&self) -> String {
            "panicking".into()
        }
        fn on_broadcast(&self, _event: &Broadcast) -> Result<(), DispatchError> {
            panic!("listener bug");
        }
    }

    #[derive(Debug)]
    struct Wrapped(Record);

    impl Envelope for Wrapped {
        fn broadcast_value(&self) -> Broadcast {
            Broadcast::Item(self.0.clone().into_item())
        }
    }

    fn item(ty: &str, id: &str) -> Broadcast {
        Broadcast::Item(Record::new(ty).with("id", id).into_item())
    }

    #[test]
    fn fifo_order_on_dispatcher_thread() {
        let dispatcher = Dispatcher::new(0);
        let (collector, done) = Collector::new("collector", 100);
        dispatcher.add_listener(collector.clone(), &[]);

        for i in 0..100 {
            dispatcher.broadcast(item("Instrument", &i.to_string())).unwrap();
        }
        assert_eq!(dispatcher.queue_length(), 100);
        dispatcher.start().unwrap();
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        dispatcher.stop();

        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(*collector.seen.lock().unwrap(), expected);
        assert_eq!(dispatcher.queue_length(), 0);
        assert!(matches!(
            dispatcher.broadcast(item("Instrument", "late")),
            Err(DispatchError::Stopped)
        ));
    }

    #[test]
    fn class_listeners_only_see_their_class() {
        let dispatcher = Dispatcher::new(0);
        let (bonds, _rx) = Collector::new("bonds", usize::MAX);
        dispatcher.add_listener(bonds.clone(), &[TypeTag::new("Bond")]);

        dispatcher.notify(item("Bond", "B1"));
        dispatcher.notify(item("Instrument", "I1"));
        assert_eq!(*bonds.seen.lock().unwrap(), vec!["B1"]);

        assert!(dispatcher.remove_listener("bonds"));
        assert!(!dispatcher.remove_listener("bonds"));
        dispatcher.notify(item("Bond", "B2"));
        assert_eq!(bonds.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn failing_listeners_are_isolated() {
        let dispatcher = Dispatcher::new(0);
        dispatcher.add_listener(Arc::new(Failing), &[]);
        dispatcher.add_listener(Arc::new(Panicking), &[]);
        let (collector, _rx) = Collector::new("after", usize::MAX);
        dispatcher.add_listener(collector.clone(), &[]);

        dispatcher.notify(item("Instrument", "A"));
        dispatcher.notify(item("Instrument", "B"));
        assert_eq!(*collector.seen.lock().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn envelopes_are_substituted() {
        let dispatcher = Dispatcher::new(0);
        let (instruments, _rx) = Collector::new("instruments", usize::MAX);
        dispatcher.add_listener(instruments.clone(), &[TypeTag::new("Instrument")]);

        let wrapped = Wrapped(Record::new("Instrument").with("id", "E"));
        dispatcher.notify(Broadcast::Envelope(Arc::new(wrapped)));
        assert_eq!(*instruments.seen.lock().unwrap(), vec!["E"]);
    }

    #[test]
    fn start_twice_is_rejected() {
        let dispatcher = Dispatcher::new(0);
        dispatcher.start().unwrap();
        assert!(matches!(dispatcher.start(), Err(DispatchError::AlreadyStarted)));
        dispatcher.stop();
        dispatcher.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clock_pulses_flow_through_the_queue() {
        struct Pulses(Mutex<Vec<u64>>);
        impl BdxListener for Pulses {
            fn name(&self) -> String {
                "pulses".into()
            }
            fn on_broadcast(&self, event: &Broadcast) -> Result<(), DispatchError> {
                if let Broadcast::Pulse(p) = event {
                    self.0.lock().unwrap().push(p.sequence);
                }
                Ok(())
            }
        }

        let dispatcher = Dispatcher::new(0);
        let pulses = Arc::new(Pulses(Mutex::new(Vec::new())));
        dispatcher.add_listener(pulses.clone(), &[TypeTag::new(CLOCK_PULSE)]);
        dispatcher.start().unwrap();
        dispatcher.start_clock(&Handle::current(), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let d = Arc::clone(&dispatcher);
        tokio::task::spawn_blocking(move || d.stop()).await.unwrap();

        let seen = pulses.0.lock().unwrap().clone();
        assert!(seen.len() >= 2, "expected pulses, got {:?}", seen);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
