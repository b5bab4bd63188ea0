//! Telemetry relay between job workers and remote observers.
//!
//! Jobs publish [`TelemetryEvent`]s into an unbounded multi-producer queue. A single
//! broadcaster task drains that queue strictly in FIFO order and forwards every event
//! to all currently connected subscribers.
//!
//! ```text
//! job worker ──publish──┐
//!                       ▼
//!                 unbounded queue ──▶ broadcaster ──▶ subscriber 1
//!                                                 ├─▶ subscriber 2
//!                                                 └─▶ ...
//! ```
//!
//! # Delivery guarantees
//!
//! - Ordering: subscribers observe events in publish order.
//! - Lossless: each subscriber has its own unbounded channel, so a slow reader never
//!   causes events to be skipped (unlike `tokio::sync::broadcast`, which drops on lag).
//! - No subscriber: the broadcaster parks on the oldest undelivered event until a
//!   subscriber connects; nothing is dropped. The queue therefore grows without bound
//!   while nobody listens.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::experiment::job::MeasurementSample;
use crate::hardware::SourceType;

/// How a job run ended, as reported to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalReason {
    /// Every sweep point was measured
    Finished,
    /// Startup or execution failed; carries the error text
    Failed(String),
    /// Stopped by the operator or by the job timeout
    Aborted(String),
}

/// Event produced by a measurement job.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// One measured sweep point
    Sample(MeasurementSample),
    /// Free-form status line (`setup completed`, ...)
    StatusText(String),
    /// Job progress in percent
    Progress(f64),
    /// Last event of a run, emitted by shutdown
    Terminal(TerminalReason),
}

#[derive(Serialize)]
struct WireSample {
    step: usize,
    current: f64,
    voltage: f64,
}

impl TelemetryEvent {
    /// Encode for the outbound event channel.
    ///
    /// Samples become `{"step":..,"current":..,"voltage":..}`, status and terminal
    /// events plain strings. Progress is only exposed through the status query and
    /// yields `None`.
    pub fn to_wire(&self) -> Option<String> {
        match self {
            TelemetryEvent::Sample(sample) => {
                let (voltage, current) = match sample.source_type {
                    SourceType::Voltage => (sample.setpoint, sample.measured),
                    SourceType::Current => (sample.measured, sample.setpoint),
                };
                serde_json::to_string(&WireSample {
                    step: sample.step,
                    current,
                    voltage,
                })
                .ok()
            }
            TelemetryEvent::StatusText(text) => Some(text.clone()),
            TelemetryEvent::Progress(_) => None,
            TelemetryEvent::Terminal(TerminalReason::Finished) => Some("Finished".to_string()),
            TelemetryEvent::Terminal(TerminalReason::Failed(message)) => Some(message.clone()),
            TelemetryEvent::Terminal(TerminalReason::Aborted(reason)) => {
                Some(format!("Aborted: {}", reason))
            }
        }
    }
}

#[derive(Default)]
struct SubscriberSet {
    next_id: AtomicU64,
    senders: Mutex<Vec<(u64, mpsc::UnboundedSender<TelemetryEvent>)>>,
    joined: Notify,
}

impl SubscriberSet {
    /// Hand `event` to every live subscriber, pruning closed ones.
    ///
    /// Returns how many subscribers received it.
    fn deliver(&self, event: &TelemetryEvent) -> usize {
        let mut senders = self.senders.lock();
        senders.retain(|(id, tx)| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                debug!(subscriber = id, "Dropping disconnected telemetry subscriber");
            }
            alive
        });
        senders.len()
    }

    fn remove(&self, id: u64) {
        self.senders.lock().retain(|(existing, _)| *existing != id);
    }
}

/// Producer handle given to job workers. Cheap to clone.
#[derive(Clone)]
pub struct TelemetryPublisher {
    tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl TelemetryPublisher {
    /// Enqueue an event. Never blocks.
    pub fn publish(&self, event: TelemetryEvent) {
        if self.tx.send(event).is_err() {
            debug!("Telemetry broadcaster stopped; event discarded");
        }
    }
}

/// Receiving side of one subscriber. Unregisters itself on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    set: Arc<SubscriberSet>,
}

impl Subscription {
    /// Subscriber id (for logs)
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the relay has been dropped and this
    /// subscription's backlog is drained
    pub async fn recv(&mut self) -> Option<TelemetryEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.set.remove(self.id);
    }
}

/// Queue + broadcaster pair
///
/// # Example
///
/// ```rust,ignore
/// let relay = TelemetryRelay::spawn();
/// let mut observer = relay.subscribe();
///
/// relay.publisher().publish(TelemetryEvent::StatusText("setup completed".into()));
/// assert!(observer.recv().await.is_some());
/// ```
pub struct TelemetryRelay {
    publisher: TelemetryPublisher,
    subscribers: Arc<SubscriberSet>,
    broadcaster: JoinHandle<()>,
}

impl TelemetryRelay {
    /// Create the queue and start the broadcaster on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribers = Arc::new(SubscriberSet::default());
        let broadcaster = tokio::spawn(run_broadcaster(rx, Arc::clone(&subscribers)));

        Self {
            publisher: TelemetryPublisher { tx },
            subscribers,
            broadcaster,
        }
    }

    /// Producer handle for job workers
    pub fn publisher(&self) -> TelemetryPublisher {
        self.publisher.clone()
    }

    /// Register a new subscriber. It receives every event not yet broadcast.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribers.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.senders.lock().push((id, tx));
        self.subscribers.joined.notify_waiters();
        debug!(subscriber = id, "Telemetry subscriber connected");

        Subscription {
            id,
            rx,
            set: Arc::clone(&self.subscribers),
        }
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.senders.lock().len()
    }
}

impl Drop for TelemetryRelay {
    fn drop(&mut self) {
        self.broadcaster.abort();
        // Closing every sender ends each subscription once its backlog is read
        self.subscribers.senders.lock().clear();
    }
}

async fn run_broadcaster(
    mut rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    subscribers: Arc<SubscriberSet>,
) {
    while let Some(event) = rx.recv().await {
        loop {
            // Register interest before checking so a subscribe() racing with the
            // delivery attempt cannot be missed.
            let joined = subscribers.joined.notified();
            tokio::pin!(joined);
            joined.as_mut().enable();

            let delivered = subscribers.deliver(&event);
            if delivered > 0 {
                trace!(delivered, "Broadcast telemetry event");
                break;
            }
            joined.await;
        }
    }
    debug!("Telemetry queue closed; broadcaster exiting");
}
