//! Request coordinator: coalesced domain fetches with stale-write rejection.
//!
//! At most one network operation per `FetchKey` is in flight for `run_all`
//! callers; a second `run_all` for the same identity joins the pending
//! operations instead of starting new ones. `refresh_domain` always starts a
//! fresh operation and supersedes the pending one. Whatever the arrival
//! order, only the result of the latest operation for a key reaches the
//! cache. Superseded operations are never aborted; their results are simply
//! dropped when they land.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::bus::{BusEvent, EventBus};
use crate::cache::{CacheEntry, SharedCache};
use crate::error::{DomainError, ErrorKind, SyncError};
use crate::fetch::{DomainFetcher, FetchOptions};
use crate::types::{Domain, DomainPayload, FetchKey, IdentityFingerprint, RunId, UserIdentity};

/// Result every caller of one network operation observes.
pub type FetchOutcome = Result<Arc<DomainPayload>, DomainError>;

// ---------------------------------------------------------------------------
// Pending fetches and run handles
// ---------------------------------------------------------------------------

/// A caller's view of one (possibly shared) network operation.
#[derive(Clone)]
pub struct PendingFetch {
    pub key: FetchKey,
    /// Run that started the network operation (not necessarily the caller's).
    pub run_id: RunId,
    /// True when this caller joined an operation someone else started.
    pub coalesced: bool,
    rx: watch::Receiver<Option<FetchOutcome>>,
}

impl PendingFetch {
    pub async fn wait(mut self) -> FetchOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => match slot.as_ref() {
                Some(outcome) => outcome.clone(),
                None => Err(aborted(&self.key)),
            },
            Err(_) => Err(aborted(&self.key)),
        }
    }
}

fn aborted(key: &FetchKey) -> DomainError {
    DomainError {
        message: format!("Fetch task for {} ended without a result", key),
        kind: ErrorKind::Transport,
        status: None,
    }
}

/// Handle for one `run_all` cycle.
#[derive(Clone)]
pub struct RunHandle {
    pub run_id: RunId,
    pub fingerprint: IdentityFingerprint,
    fetches: Vec<(Domain, PendingFetch)>,
}

impl RunHandle {
    pub fn domains(&self) -> Vec<Domain> {
        self.fetches.iter().map(|(d, _)| *d).collect()
    }

    /// Number of domains served by an operation another run started.
    pub fn coalesced_count(&self) -> usize {
        self.fetches.iter().filter(|(_, f)| f.coalesced).count()
    }

    /// Wait for every domain. One domain failing never fails the others.
    pub async fn join(self) -> RunReport {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (domain, pending) in self.fetches {
            match pending.wait().await {
                Ok(_) => succeeded.push(domain),
                Err(_) => failed.push(domain),
            }
        }
        RunReport {
            run_id: self.run_id,
            fingerprint: self.fingerprint,
            succeeded,
            failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: RunId,
    pub fingerprint: IdentityFingerprint,
    pub succeeded: Vec<Domain>,
    pub failed: Vec<Domain>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestMode {
    /// Join a pending operation for the key if there is one.
    Coalesce,
    /// Always start a new operation; it becomes the only one allowed to write.
    Supersede,
}

struct InFlight {
    run_id: RunId,
    rx: watch::Receiver<Option<FetchOutcome>>,
}

#[derive(Default)]
struct CoordinatorState {
    inflight: HashMap<FetchKey, InFlight>,
    /// Run of the newest operation started per key; the only run allowed to write.
    current: HashMap<FetchKey, RunId>,
    /// Run currently owning the UI loading flag.
    loading_run: Option<RunId>,
}

struct Inner {
    fetcher: Arc<dyn DomainFetcher>,
    cache: Arc<SharedCache>,
    bus: EventBus,
    hard_timeout: Duration,
    next_run: AtomicU64,
    state: Mutex<CoordinatorState>,
    loading: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<Inner>,
}

impl RequestCoordinator {
    pub fn new(
        fetcher: Arc<dyn DomainFetcher>,
        cache: Arc<SharedCache>,
        bus: EventBus,
        hard_timeout: Duration,
    ) -> Self {
        let (loading, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                fetcher,
                cache,
                bus,
                hard_timeout,
                next_run: AtomicU64::new(1),
                state: Mutex::new(CoordinatorState::default()),
                loading,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<SharedCache> {
        &self.inner.cache
    }

    pub fn is_loading(&self) -> bool {
        *self.inner.loading.borrow()
    }

    pub fn loading(&self) -> watch::Receiver<bool> {
        self.inner.loading.subscribe()
    }

    /// Number of network operations currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inner.state.lock().inflight.len()
    }

    fn allocate_run(&self) -> RunId {
        RunId(self.inner.next_run.fetch_add(1, Ordering::SeqCst))
    }

    /// Fire every domain fetch for `identity` concurrently under a new run.
    ///
    /// Keys that already have an operation in flight are joined, not refetched.
    /// The loading flag is raised until every domain settles or the hard
    /// timeout passes, whichever comes first.
    pub fn run_all(&self, identity: &UserIdentity) -> RunHandle {
        let run_id = self.allocate_run();
        let fingerprint = identity.fingerprint();

        let fetches: Vec<(Domain, PendingFetch)> = Domain::ALL
            .iter()
            .map(|domain| {
                let pending = self.request(
                    *domain,
                    identity,
                    run_id,
                    RequestMode::Coalesce,
                    FetchOptions::default(),
                );
                (*domain, pending)
            })
            .collect();

        let handle = RunHandle {
            run_id,
            fingerprint,
            fetches,
        };
        log::info!(
            "Coordinator: {} started for {} ({} domains, {} joined in-flight)",
            run_id,
            handle.fingerprint,
            handle.fetches.len(),
            handle.coalesced_count()
        );

        self.set_loading(run_id, true);
        self.supervise(handle.clone());
        handle
    }

    /// Coalesced fetch of one domain, for callers that need a value now.
    pub fn fetch_domain(&self, domain: Domain, identity: &UserIdentity) -> PendingFetch {
        let run_id = self.allocate_run();
        self.request(
            domain,
            identity,
            run_id,
            RequestMode::Coalesce,
            FetchOptions::default(),
        )
    }

    /// Start a forced refetch of one domain that supersedes anything pending.
    ///
    /// Used by push invalidation, polling and optimistic writes; never a full run.
    pub fn refresh_domain(&self, domain: Domain, identity: &UserIdentity) -> PendingFetch {
        let run_id = self.allocate_run();
        self.request(
            domain,
            identity,
            run_id,
            RequestMode::Supersede,
            FetchOptions {
                force_refresh: true,
            },
        )
    }

    /// Cached entry if present, otherwise fetch (coalesced) and read back.
    pub async fn read_or_fetch(
        &self,
        domain: Domain,
        identity: &UserIdentity,
    ) -> Option<Arc<CacheEntry>> {
        let fingerprint = identity.fingerprint();
        if let Some(entry) = self.inner.cache.read(domain, &fingerprint) {
            return Some(entry);
        }
        let _ = self.fetch_domain(domain, identity).wait().await;
        self.inner.cache.read(domain, &fingerprint)
    }

    /// Make any pending operation for `key` unable to write, without starting one.
    pub fn supersede(&self, key: &FetchKey) -> RunId {
        let run_id = self.allocate_run();
        let mut state = self.inner.state.lock();
        state.inflight.remove(key);
        state.current.insert(key.clone(), run_id);
        log::debug!("Coordinator: {} superseded by {}", key, run_id);
        run_id
    }

    /// Forget every key of an identity so late results for it are discarded.
    pub fn retire_identity(&self, fingerprint: &IdentityFingerprint) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.current.len();
        state.inflight.retain(|key, _| &key.fingerprint != fingerprint);
        state.current.retain(|key, _| &key.fingerprint != fingerprint);
        let retired = before - state.current.len();
        if retired > 0 {
            log::info!("Coordinator: retired {} key(s) for {}", retired, fingerprint);
        }
        retired
    }

    fn request(
        &self,
        domain: Domain,
        identity: &UserIdentity,
        run_id: RunId,
        mode: RequestMode,
        options: FetchOptions,
    ) -> PendingFetch {
        let key = FetchKey::new(domain, identity.fingerprint());
        let mut state = self.inner.state.lock();

        if mode == RequestMode::Coalesce {
            // A closed sender means the task died; start over instead of joining it
            let live = state
                .inflight
                .get(&key)
                .filter(|existing| existing.rx.has_changed().is_ok());
            if let Some(existing) = live {
                log::debug!(
                    "Coordinator: {} joined in-flight {} for {}",
                    run_id,
                    existing.run_id,
                    key
                );
                return PendingFetch {
                    key,
                    run_id: existing.run_id,
                    coalesced: true,
                    rx: existing.rx.clone(),
                };
            }
        }

        let (tx, rx) = watch::channel(None);
        state.current.insert(key.clone(), run_id);
        state.inflight.insert(
            key.clone(),
            InFlight {
                run_id,
                rx: rx.clone(),
            },
        );
        drop(state);

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            let guard = InFlightGuard {
                inner: Arc::clone(&inner),
                key: task_key.clone(),
                run_id,
            };
            let outcome = perform_fetch(inner.fetcher.as_ref(), domain, &identity, options).await;
            inner.complete(&task_key, run_id, &outcome);
            drop(guard);
            let _ = tx.send(Some(outcome));
        });

        PendingFetch {
            key,
            run_id,
            coalesced: false,
            rx,
        }
    }

    fn set_loading(&self, run_id: RunId, loading: bool) {
        let changed = {
            let mut state = self.inner.state.lock();
            if loading {
                state.loading_run = Some(run_id);
            } else if state.loading_run != Some(run_id) {
                // A newer run owns the flag
                return;
            } else {
                state.loading_run = None;
            }
            *self.inner.loading.borrow() != loading
        };
        self.inner.loading.send_replace(loading);
        if changed {
            self.inner.bus.publish(BusEvent::LoadingChanged { loading });
        }
    }

    /// Clear the loading flag when the run settles or the hard timeout fires.
    fn supervise(&self, handle: RunHandle) {
        let coordinator = self.clone();
        let timeout = self.inner.hard_timeout;
        tokio::spawn(async move {
            let run_id = handle.run_id;
            let join = handle.join();
            tokio::pin!(join);

            let report = tokio::select! {
                report = &mut join => report,
                _ = tokio::time::sleep(timeout) => {
                    log::warn!(
                        "Coordinator: {} still pending after {} ms, clearing loading flag",
                        run_id,
                        timeout.as_millis()
                    );
                    coordinator.set_loading(run_id, false);
                    join.await
                }
            };

            coordinator.set_loading(run_id, false);
            if report.failed.is_empty() {
                log::info!("Coordinator: {} settled", run_id);
            } else {
                log::warn!(
                    "Coordinator: {} settled with {} unavailable domain(s): {:?}",
                    run_id,
                    report.failed.len(),
                    report.failed
                );
            }
            coordinator.inner.bus.publish(BusEvent::RunCompleted {
                run_id,
                fingerprint: report.fingerprint,
                failed: report.failed,
            });
        });
    }
}

impl Inner {
    /// Apply an arrived result if its run is still the current one for the key.
    fn complete(&self, key: &FetchKey, run_id: RunId, outcome: &FetchOutcome) -> bool {
        let mut state = self.state.lock();
        if state.inflight.get(key).map(|f| f.run_id) == Some(run_id) {
            state.inflight.remove(key);
        }

        let current = state.current.get(key).copied();
        if current != Some(run_id) {
            log::debug!(
                "Coordinator: discarding stale result for {} from {} (current {:?})",
                key,
                run_id,
                current
            );
            return false;
        }

        // Written under the lock so a newer run cannot interleave
        let written = match outcome {
            Ok(payload) => Ok(DomainPayload::clone(payload)),
            Err(error) => Err(error.clone()),
        };
        self.cache
            .write(key.domain, &key.fingerprint, written, Some(run_id));
        true
    }
}

/// Frees a key's in-flight slot when its fetch task ends early (panic or abort).
struct InFlightGuard {
    inner: Arc<Inner>,
    key: FetchKey,
    run_id: RunId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.inflight.get(&self.key).map(|f| f.run_id) == Some(self.run_id) {
            state.inflight.remove(&self.key);
            log::warn!(
                "Coordinator: fetch task for {} ({}) ended without a result",
                self.key,
                self.run_id
            );
        }
    }
}

/// One primary attempt, plus one legacy attempt when the domain has one.
async fn perform_fetch(
    fetcher: &dyn DomainFetcher,
    domain: Domain,
    identity: &UserIdentity,
    options: FetchOptions,
) -> FetchOutcome {
    let primary = fetcher
        .fetch(domain, identity, options)
        .await
        .and_then(|payload| check_shape(domain, payload));

    let err = match primary {
        Ok(payload) => return Ok(Arc::new(payload)),
        Err(e) => e,
    };

    if err.should_try_fallback() && fetcher.has_fallback(domain) {
        log::warn!("Coordinator: {} failed ({}), trying legacy endpoint", domain, err);
        return match fetcher
            .fetch_fallback(domain, identity)
            .await
            .and_then(|payload| check_shape(domain, payload))
        {
            Ok(payload) => Ok(Arc::new(payload)),
            Err(fallback_err) => {
                log::warn!("Coordinator: {} legacy endpoint failed: {}", domain, fallback_err);
                Err(DomainError::from(&fallback_err))
            }
        };
    }

    log::warn!("Coordinator: {} unavailable: {}", domain, err);
    Err(DomainError::from(&err))
}

fn check_shape(domain: Domain, payload: DomainPayload) -> Result<DomainPayload, SyncError> {
    if payload.fits(domain) {
        Ok(payload)
    } else {
        Err(SyncError::Malformed(format!(
            "{} returned a payload of the wrong shape",
            domain
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DomainState;
    use crate::test_utils::{attendance, enquiry_counts, identity, FakeFetcher, FakeReply};

    fn coordinator(fetcher: Arc<FakeFetcher>) -> (RequestCoordinator, Arc<SharedCache>) {
        let cache = Arc::new(SharedCache::new("1"));
        let coordinator = RequestCoordinator::new(
            fetcher,
            Arc::clone(&cache),
            EventBus::default(),
            Duration::from_secs(5),
        );
        (coordinator, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_for_same_key_make_one_call() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.script(Domain::Attendance, FakeReply::ok_after(attendance("AC", false), 50));
        let (coordinator, _cache) = coordinator(Arc::clone(&fetcher));
        let user = identity("ac@example.com", "AC");

        let first = coordinator.fetch_domain(Domain::Attendance, &user);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = coordinator.fetch_domain(Domain::Attendance, &user);
        assert!(second.coalesced);

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(fetcher.calls(Domain::Attendance), 1);
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_all_joins_pending_fetches() {
        let fetcher = Arc::new(FakeFetcher::new().with_default_delay(100));
        let (coordinator, _cache) = coordinator(Arc::clone(&fetcher));
        let user = identity("ac@example.com", "AC");

        let first = coordinator.run_all(&user);
        let second = coordinator.run_all(&user);
        assert!(second.run_id > first.run_id);
        assert_eq!(second.coalesced_count(), Domain::ALL.len());

        let report = second.join().await;
        assert!(report.failed.is_empty());
        for domain in Domain::ALL {
            assert_eq!(fetcher.calls(domain), 1, "{} fetched more than once", domain);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_result_arriving_last_is_discarded() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.script(Domain::EnquiryCounts, FakeReply::ok_after(enquiry_counts(1), 100));
        fetcher.script_forced(Domain::EnquiryCounts, FakeReply::ok_after(enquiry_counts(2), 10));
        let (coordinator, cache) = coordinator(Arc::clone(&fetcher));
        let user = identity("ac@example.com", "AC");

        let old = coordinator.fetch_domain(Domain::EnquiryCounts, &user);
        let new = coordinator.refresh_domain(Domain::EnquiryCounts, &user);
        assert!(new.run_id > old.run_id);

        new.wait().await.unwrap();
        // The old caller still gets its own answer, it just never reaches the cache
        assert_eq!(*old.wait().await.unwrap(), enquiry_counts(1));

        let entry = cache.read(Domain::EnquiryCounts, &user.fingerprint()).unwrap();
        assert_eq!(entry.value(), Some(&enquiry_counts(2)));
        assert_eq!(fetcher.calls(Domain::EnquiryCounts), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failing_domain_does_not_block_others() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.script(Domain::Attendance, FakeReply::http(500));
        let (coordinator, cache) = coordinator(Arc::clone(&fetcher));
        let user = identity("ac@example.com", "AC");

        let report = coordinator.run_all(&user).join().await;
        assert_eq!(report.failed, vec![Domain::Attendance]);
        assert_eq!(report.succeeded.len(), Domain::ALL.len() - 1);

        let snap = cache.snapshot(&user.fingerprint());
        assert!(matches!(snap.state(Domain::Attendance), DomainState::Unavailable(_)));
        assert!(matches!(snap.state(Domain::AnnualLeave), DomainState::Ready(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_endpoint_tried_once() {
        let fetcher = Arc::new(FakeFetcher::new().with_fallback(Domain::TimeTotals));
        fetcher.script(Domain::TimeTotals, FakeReply::http(503));
        let (coordinator, cache) = coordinator(Arc::clone(&fetcher));
        let user = identity("ac@example.com", "AC");

        let outcome = coordinator.fetch_domain(Domain::TimeTotals, &user).wait().await;
        assert!(outcome.is_ok());
        assert_eq!(fetcher.fallback_calls(Domain::TimeTotals), 1);
        assert!(cache
            .read(Domain::TimeTotals, &user.fingerprint())
            .unwrap()
            .value()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fallback_on_client_error() {
        let fetcher = Arc::new(FakeFetcher::new().with_fallback(Domain::TimeTotals));
        fetcher.script(Domain::TimeTotals, FakeReply::http(401));
        let (coordinator, cache) = coordinator(Arc::clone(&fetcher));
        let user = identity("ac@example.com", "AC");

        let outcome = coordinator.fetch_domain(Domain::TimeTotals, &user).wait().await;
        assert_eq!(outcome.unwrap_err().status, Some(401));
        assert_eq!(fetcher.fallback_calls(Domain::TimeTotals), 0);
        assert!(cache
            .read(Domain::TimeTotals, &user.fingerprint())
            .unwrap()
            .error()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_payload_shape_is_malformed() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.script(Domain::Attendance, FakeReply::ok_after(enquiry_counts(3), 1));
        let (coordinator, _cache) = coordinator(Arc::clone(&fetcher));
        let user = identity("ac@example.com", "AC");

        let err = coordinator
            .fetch_domain(Domain::Attendance, &user)
            .wait()
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Malformed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_fetch_task_does_not_stall_key() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.script(Domain::Attendance, FakeReply::panic());
        let (coordinator, cache) = coordinator(Arc::clone(&fetcher));
        let user = identity("ac@example.com", "AC");

        let first = coordinator.fetch_domain(Domain::Attendance, &user);
        assert!(first.wait().await.is_err());
        assert_eq!(coordinator.inflight_count(), 0);

        let second = coordinator.fetch_domain(Domain::Attendance, &user);
        assert!(!second.coalesced);
        assert!(second.wait().await.is_ok());
        assert_eq!(fetcher.calls(Domain::Attendance), 2);
        assert!(cache
            .read(Domain::Attendance, &user.fingerprint())
            .unwrap()
            .value()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_timeout_clears_loading_flag() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.script(Domain::Instructions, FakeReply::hang());
        let (coordinator, cache) = coordinator(Arc::clone(&fetcher));
        let user = identity("ac@example.com", "AC");

        let _handle = coordinator.run_all(&user);
        assert!(coordinator.is_loading());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!coordinator.is_loading());
        // The hung call is still in flight; only the flag was cleared
        assert_eq!(coordinator.inflight_count(), 1);
        assert!(cache.read(Domain::Instructions, &user.fingerprint()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retired_identity_results_are_discarded() {
        let fetcher = Arc::new(FakeFetcher::new().with_default_delay(100));
        let (coordinator, cache) = coordinator(Arc::clone(&fetcher));
        let user = identity("ac@example.com", "AC");

        let handle = coordinator.run_all(&user);
        coordinator.retire_identity(&user.fingerprint());
        handle.join().await;

        assert!(cache.snapshot(&user.fingerprint()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_or_fetch_uses_cache_first() {
        let fetcher = Arc::new(FakeFetcher::new());
        let (coordinator, _cache) = coordinator(Arc::clone(&fetcher));
        let user = identity("ac@example.com", "AC");

        assert!(coordinator.read_or_fetch(Domain::AnnualLeave, &user).await.is_some());
        assert!(coordinator.read_or_fetch(Domain::AnnualLeave, &user).await.is_some());
        assert_eq!(fetcher.calls(Domain::AnnualLeave), 1);
    }
}
