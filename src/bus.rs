//! Typed in-process event bus.
//!
//! Replaces ad-hoc global listeners: publishers send `BusEvent`s over a
//! tokio broadcast channel, each consumer holds a `BusSubscription`, and
//! dropping the subscription is the unsubscribe.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{ActionActivation, Domain, IdentityFingerprint, RunId};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BusEvent {
    /// A cache entry was written or removed.
    CacheChanged {
        domain: Domain,
        fingerprint: IdentityFingerprint,
    },
    IdentityChanged {
        previous: Option<IdentityFingerprint>,
        current: IdentityFingerprint,
    },
    LoadingChanged { loading: bool },
    RunCompleted {
        run_id: RunId,
        fingerprint: IdentityFingerprint,
        failed: Vec<Domain>,
    },
    /// Optional highlight hint from a change stream.
    RecordPulse { domain: Domain, record_id: String },
    Navigate { tab: String },
    ActionActivated {
        title: String,
        activation: ActionActivation,
    },
}

impl BusEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BusEvent::CacheChanged { .. } => "cache_changed",
            BusEvent::IdentityChanged { .. } => "identity_changed",
            BusEvent::LoadingChanged { .. } => "loading_changed",
            BusEvent::RunCompleted { .. } => "run_completed",
            BusEvent::RecordPulse { .. } => "record_pulse",
            BusEvent::Navigate { .. } => "navigate",
            BusEvent::ActionActivated { .. } => "action_activated",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every live subscription. No subscribers is not an error.
    pub fn publish(&self, event: BusEvent) {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(receivers) => {
                log::trace!("Bus: {} delivered to {} subscriber(s)", event_type, receivers)
            }
            Err(_) => log::trace!("Bus: {} dropped, no subscribers", event_type),
        }
    }

    pub fn subscribe(&self) -> BusSubscription {
        let id = Uuid::new_v4();
        log::debug!("Bus: subscription {} opened", id);
        BusSubscription {
            id,
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

pub struct BusSubscription {
    id: Uuid,
    rx: broadcast::Receiver<BusEvent>,
}

impl BusSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the bus is gone.
    ///
    /// A lagging subscriber skips what it missed; consumers re-read state
    /// on each event, so only the latest matters.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Bus: subscription {} lagged by {} event(s)", self.id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        log::debug!("Bus: subscription {} closed", self.id);
    }
}
