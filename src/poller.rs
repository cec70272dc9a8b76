//! Polling fallback for domains without a change stream.
//!
//! Same invalidation entry point as push events, so a poll tick and a push
//! event landing together still cost one refetch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::realtime::Invalidator;
use crate::types::Domain;

pub async fn run_domain_poller(
    invalidator: Invalidator,
    domains: Vec<Domain>,
    interval: Duration,
    wake: Arc<Notify>,
) {
    if domains.is_empty() || interval.is_zero() {
        log::info!("Poller: nothing to poll, not starting");
        return;
    }
    log::info!(
        "Poller: polling {:?} every {} s",
        domains,
        interval.as_secs()
    );

    loop {
        // The initial run_all already covers the first interval
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = wake.notified() => {
                log::info!("Poller: woken by manual refresh");
            },
        }

        for domain in &domains {
            invalidator.notify(*domain);
        }
    }
}
