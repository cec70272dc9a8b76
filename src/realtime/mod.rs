//! Push-driven invalidation.
//!
//! One durable subscription per push-capable domain feeds change events into
//! the `Invalidator`. Events are deduplicated by id, then debounced: a burst
//! inside the window collapses into one invalidate-and-refetch of just the
//! affected domain. Polling calls the same `notify` entry point.

pub mod sse;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::bus::{BusEvent, EventBus};
use crate::coordinator::RequestCoordinator;
use crate::error::SyncError;
use crate::types::{Domain, UserIdentity};

pub use sse::SseChangeSource;

/// Event ids remembered per domain for replay suppression.
const SEEN_IDS_PER_DOMAIN: usize = 256;
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// "Something changed" for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub domain: Domain,
    pub event_id: Option<String>,
    /// Changed record, when the server says. Only used for a UI pulse.
    pub record_id: Option<String>,
}

/// Opens change streams. One connection per domain, identity-independent.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn connect(&self, domain: Domain) -> Result<Box<dyn ChangeStream>, SyncError>;
}

#[async_trait]
pub trait ChangeStream: Send {
    /// Next event; `Ok(None)` when the server closed the stream.
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, SyncError>;
}

// ---------------------------------------------------------------------------
// Invalidator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    /// Record `id`; false if it was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= SEEN_IDS_PER_DOMAIN {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

struct Shared {
    tx: mpsc::UnboundedSender<Domain>,
    seen: Mutex<HashMap<Domain, SeenIds>>,
    bus: EventBus,
}

#[derive(Clone)]
pub struct Invalidator {
    shared: Arc<Shared>,
}

impl Invalidator {
    /// Start the debounce loop. It ends when the last clone is dropped.
    pub fn start(
        coordinator: RequestCoordinator,
        identity: watch::Receiver<Option<UserIdentity>>,
        bus: EventBus,
        debounce: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_debounce_loop(rx, coordinator, identity, debounce));
        Self {
            shared: Arc::new(Shared {
                tx,
                seen: Mutex::new(HashMap::new()),
                bus,
            }),
        }
    }

    /// Ask for `domain` to be invalidated and refetched after the debounce.
    ///
    /// Requests queue unbounded and collapse per domain when the window drains.
    pub fn notify(&self, domain: Domain) {
        if self.shared.tx.send(domain).is_err() {
            log::debug!("Invalidator: stopped, ignoring change to {}", domain);
        }
    }

    /// Feed one change event. Returns false for a replayed event id.
    pub fn handle_event(&self, event: ChangeEvent) -> bool {
        if let Some(id) = &event.event_id {
            let fresh = self
                .shared
                .seen
                .lock()
                .entry(event.domain)
                .or_default()
                .insert(id);
            if !fresh {
                log::debug!("Invalidator: ignoring replayed event {} for {}", id, event.domain);
                return false;
            }
        }

        if let Some(record_id) = event.record_id {
            self.shared.bus.publish(BusEvent::RecordPulse {
                domain: event.domain,
                record_id,
            });
        }
        self.notify(event.domain);
        true
    }

    /// Keep a subscription to `domain` open, reconnecting with backoff.
    pub fn subscribe(&self, source: Arc<dyn ChangeSource>, domain: Domain) -> JoinHandle<()> {
        let invalidator = self.clone();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(RECONNECT_INITIAL, RECONNECT_MAX);
            loop {
                match source.connect(domain).await {
                    Ok(mut stream) => {
                        log::info!("Invalidator: subscribed to {} changes", domain);
                        backoff.reset();
                        loop {
                            match stream.next_event().await {
                                Ok(Some(event)) => {
                                    invalidator.handle_event(event);
                                }
                                Ok(None) => {
                                    log::info!("Invalidator: {} stream closed by server", domain);
                                    break;
                                }
                                Err(e) => {
                                    log::warn!("Invalidator: {} stream error: {}", domain, e);
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("Invalidator: connect to {} changes failed: {}", domain, e);
                    }
                }
                let delay = backoff.next_delay();
                log::debug!(
                    "Invalidator: reconnecting {} in {} ms",
                    domain,
                    delay.as_millis()
                );
                sleep(delay).await;
            }
        })
    }
}

async fn run_debounce_loop(
    mut rx: mpsc::UnboundedReceiver<Domain>,
    coordinator: RequestCoordinator,
    identity: watch::Receiver<Option<UserIdentity>>,
    debounce: Duration,
) {
    loop {
        let first = match rx.recv().await {
            Some(domain) => domain,
            None => break,
        };

        // Collect everything that lands inside the window
        sleep(debounce).await;
        let mut domains = BTreeSet::from([first]);
        while let Ok(domain) = rx.try_recv() {
            domains.insert(domain);
        }

        let current = identity.borrow().clone();
        let Some(user) = current else {
            log::debug!("Invalidator: no identity yet, skipping refresh of {:?}", domains);
            continue;
        };
        let fingerprint = user.fingerprint();
        for domain in domains {
            log::info!("Invalidator: refreshing {} for {}", domain, fingerprint);
            coordinator.cache().invalidate(domain, &fingerprint);
            // Runs detached; the result lands in the cache
            let _pending = coordinator.refresh_domain(domain, &user);
        }
    }
    log::info!("Invalidator: stopped");
}

/// Doubling reconnect delay with an upper bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
