//! Dashboard session state.
//!
//! `Dashboard` is constructed once per session and shared by `Arc`. It owns
//! the cache, the coordinator, the event bus and the invalidator, tracks the
//! resolved identity, and keeps the derived action feed current.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::actions::week::WeekCutover;
use crate::actions::{demo_actions, derive_feed, ActionFeed, DeriveContext};
use crate::bus::{BusEvent, EventBus};
use crate::cache::SharedCache;
use crate::config::Config;
use crate::coordinator::{PendingFetch, RequestCoordinator, RunHandle};
use crate::error::SyncError;
use crate::fetch::DomainFetcher;
use crate::poller::run_domain_poller;
use crate::prefs::{save_preferences, Preferences};
use crate::realtime::{ChangeSource, Invalidator};
use crate::types::{
    ActionActivation, ActionItem, AttendanceRecord, AttendanceState, Domain, DomainPayload,
    DomainRecord, FetchKey, IdentityFingerprint, UserIdentity,
};

pub struct Dashboard {
    config: Config,
    prefs: RwLock<Preferences>,
    prefs_path: Mutex<Option<PathBuf>>,
    bus: EventBus,
    cache: Arc<SharedCache>,
    coordinator: RequestCoordinator,
    invalidator: Invalidator,
    cutover: WeekCutover,
    identity: watch::Sender<Option<UserIdentity>>,
    feed: watch::Sender<ActionFeed>,
    poll_wake: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dashboard {
    /// Build the session. Must be called inside a tokio runtime.
    pub fn new(config: Config, prefs: Preferences, fetcher: Arc<dyn DomainFetcher>) -> Arc<Self> {
        let bus = EventBus::default();
        let cache = Arc::new(SharedCache::new(config.sync.cache_version.clone()).with_bus(bus.clone()));
        let coordinator = RequestCoordinator::new(
            fetcher,
            Arc::clone(&cache),
            bus.clone(),
            Duration::from_millis(config.sync.hard_timeout_ms),
        );
        let (identity, identity_rx) = watch::channel(None);
        let invalidator = Invalidator::start(
            coordinator.clone(),
            identity_rx,
            bus.clone(),
            Duration::from_millis(config.sync.debounce_ms),
        );
        let (feed, _) = watch::channel(ActionFeed::default());
        let cutover = WeekCutover::from_config(&config.attendance_cutover);

        let dashboard = Arc::new(Self {
            config,
            prefs: RwLock::new(prefs),
            prefs_path: Mutex::new(None),
            bus,
            cache,
            coordinator,
            invalidator,
            cutover,
            identity,
            feed,
            poll_wake: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let feed_task = spawn_feed_task(Arc::downgrade(&dashboard), dashboard.bus.subscribe());
        dashboard.tasks.lock().push(feed_task);
        dashboard.recompute_feed();
        dashboard
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cache(&self) -> &Arc<SharedCache> {
        &self.cache
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    pub fn preferences(&self) -> Preferences {
        self.prefs.read().clone()
    }

    pub fn identity(&self) -> Option<UserIdentity> {
        self.identity.borrow().clone()
    }

    fn fingerprint(&self) -> Option<IdentityFingerprint> {
        self.identity.borrow().as_ref().map(UserIdentity::fingerprint)
    }

    pub fn relevant_week(&self) -> NaiveDate {
        self.cutover.relevant_week_start(Utc::now())
    }

    // -- identity -----------------------------------------------------------

    /// Switch to `identity` and load every domain for it.
    ///
    /// The previous identity's entries are dropped and its in-flight results
    /// will be discarded, so nothing it fetched can surface afterwards.
    /// Setting the identity already in use is a no-op.
    pub fn set_identity(&self, identity: UserIdentity) -> Option<RunHandle> {
        let current = identity.fingerprint();
        let previous = self.fingerprint();
        if previous.as_ref() == Some(&current) {
            log::debug!("Dashboard: identity {} unchanged", current);
            return None;
        }

        if let Some(prev) = &previous {
            self.coordinator.retire_identity(prev);
            self.cache.invalidate_all(prev);
        }
        self.identity.send_replace(Some(identity.clone()));
        log::info!(
            "Dashboard: identity {} -> {}",
            previous.as_ref().map(|p| p.as_str()).unwrap_or("none"),
            current
        );
        self.bus.publish(BusEvent::IdentityChanged {
            previous,
            current,
        });

        let handle = self.coordinator.run_all(&identity);
        self.recompute_feed();
        Some(handle)
    }

    /// Reload every domain for the current identity. Pending fetches are joined.
    pub fn refresh_all(&self) -> Option<RunHandle> {
        let identity = self.identity()?;
        Some(self.coordinator.run_all(&identity))
    }

    // -- optimistic writes --------------------------------------------------

    /// Show `payload` immediately, then replace it with the server's answer.
    ///
    /// Anything already in flight for the domain is superseded first so it
    /// cannot overwrite the tentative value.
    pub fn apply_optimistic(&self, domain: Domain, payload: DomainPayload) -> Option<PendingFetch> {
        let identity = self.identity()?;
        let fingerprint = identity.fingerprint();
        if !payload.fits(domain) {
            log::warn!("Dashboard: optimistic payload does not fit {}, ignored", domain);
            return None;
        }

        self.coordinator
            .supersede(&FetchKey::new(domain, fingerprint.clone()));
        self.cache.write_tentative(domain, &fingerprint, payload);
        Some(self.coordinator.refresh_domain(domain, &identity))
    }

    /// Optimistically mark the current user's relevant week as confirmed.
    pub fn confirm_attendance(&self) -> Option<PendingFetch> {
        let identity = self.identity()?;
        let week = self.relevant_week();
        let mut state = match self
            .cache
            .read(Domain::Attendance, &identity.fingerprint())
            .as_deref()
            .and_then(|entry| entry.value())
        {
            Some(DomainPayload::Attendance(state)) => state.clone(),
            _ => AttendanceState::default(),
        };

        let now = Utc::now();
        match state
            .records
            .iter_mut()
            .find(|r| r.week_start == week && r.is_owned_by(&identity.initials))
        {
            Some(record) => record.confirmed_at = Some(now),
            None => state.records.push(AttendanceRecord {
                owner_initials: identity.initials.clone(),
                week_start: week,
                days: Vec::new(),
                confirmed_at: Some(now),
            }),
        }
        self.apply_optimistic(Domain::Attendance, DomainPayload::Attendance(state))
    }

    // -- actions ------------------------------------------------------------

    /// Derived actions, kept current as the cache changes.
    pub fn actions(&self) -> watch::Receiver<ActionFeed> {
        self.feed.subscribe()
    }

    pub fn current_feed(&self) -> ActionFeed {
        self.feed.borrow().clone()
    }

    /// Dispatch point for an action's workflow; the workflow itself lives elsewhere.
    pub fn activate(&self, item: &ActionItem) {
        log::info!("Dashboard: activated '{}'", item.title);
        if let ActionActivation::Navigate { tab } = &item.activation {
            self.bus.publish(BusEvent::Navigate { tab: tab.clone() });
        }
        self.bus.publish(BusEvent::ActionActivated {
            title: item.title.clone(),
            activation: item.activation.clone(),
        });
    }

    // -- preferences --------------------------------------------------------

    /// Persist preference changes to `path` from now on.
    pub fn set_preferences_path(&self, path: PathBuf) {
        *self.prefs_path.lock() = Some(path);
    }

    pub fn set_demo_mode(&self, enabled: bool) {
        self.prefs.write().demo_mode = enabled;
        self.persist_preferences();
        self.recompute_feed();
    }

    pub fn set_actions_collapsed(&self, collapsed: bool) {
        self.prefs.write().actions_collapsed = collapsed;
        self.persist_preferences();
    }

    fn persist_preferences(&self) {
        let Some(path) = self.prefs_path.lock().clone() else {
            return;
        };
        let prefs = self.preferences();
        if let Err(e) = save_preferences(&path, &prefs) {
            log::warn!("Dashboard: failed to save preferences: {}", e);
        }
    }

    fn affects_feed(&self, event: &BusEvent) -> bool {
        match event {
            BusEvent::CacheChanged { fingerprint, .. } => {
                self.fingerprint().as_ref() == Some(fingerprint)
            }
            BusEvent::IdentityChanged { .. } | BusEvent::LoadingChanged { .. } => true,
            _ => false,
        }
    }

    fn recompute_feed(&self) {
        let demo_mode = self.prefs.read().demo_mode;
        let feed = match self.identity() {
            Some(identity) => {
                let snapshot = self.cache.snapshot(&identity.fingerprint());
                let ctx = DeriveContext {
                    identity: &identity,
                    approvers: &self.config.roles.approvers,
                    environment: self.config.roles.environment,
                    demo_mode,
                    relevant_week: self.relevant_week(),
                };
                derive_feed(&snapshot, &ctx, self.coordinator.is_loading())
            }
            None if demo_mode => ActionFeed {
                items: demo_actions(),
                ready: true,
                loading: false,
                empty: false,
            },
            // Identity not resolved yet: nothing to fetch, keep the skeleton
            None => ActionFeed {
                items: Vec::new(),
                ready: false,
                loading: true,
                empty: true,
            },
        };

        self.feed.send_if_modified(|current| {
            if *current == feed {
                return false;
            }
            log::debug!(
                "Dashboard: action feed now {} item(s), ready={}",
                feed.items.len(),
                feed.ready
            );
            *current = feed;
            true
        });
    }

    // -- background work ----------------------------------------------------

    /// Open a change-stream subscription for every push domain.
    pub fn start_realtime(&self, source: Arc<dyn ChangeSource>) {
        let domains = self.config.sync.push_domains();
        let mut tasks = self.tasks.lock();
        for domain in domains {
            tasks.push(self.invalidator.subscribe(Arc::clone(&source), domain));
        }
    }

    /// Poll the domains that have no change stream.
    pub fn start_poller(&self) {
        let push = self.config.sync.push_domains();
        let domains: Vec<Domain> = Domain::ALL
            .iter()
            .copied()
            .filter(|d| !push.contains(d))
            .collect();
        let task = tokio::spawn(run_domain_poller(
            self.invalidator.clone(),
            domains,
            Duration::from_secs(self.config.sync.poll_interval_secs),
            Arc::clone(&self.poll_wake),
        ));
        self.tasks.lock().push(task);
    }

    /// Wake the poller now instead of at the next interval.
    pub fn poll_now(&self) {
        self.poll_wake.notify_one();
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<usize, SyncError> {
        self.cache.save_snapshot(path)
    }

    pub fn load_snapshot(&self, path: &Path) -> Result<usize, SyncError> {
        let loaded = self.cache.load_snapshot(path)?;
        self.recompute_feed();
        Ok(loaded)
    }

    /// Stop subscriptions, the poller and the feed task.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        log::info!("Dashboard: stopping {} background task(s)", tasks.len());
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn spawn_feed_task(
    dashboard: Weak<Dashboard>,
    mut sub: crate::bus::BusSubscription,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            let Some(dashboard) = dashboard.upgrade() else {
                break;
            };
            if dashboard.affects_feed(&event) {
                dashboard.recompute_feed();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::priority::{APPROVE_LEAVE, CONFIRM_ATTENDANCE};
    use crate::test_utils::{
        attendance_record, identity, leave, leave_state, review, review_queue, FakeFetcher,
        FakeReply,
    };
    use crate::types::LeaveStatus;

    fn config() -> Config {
        let mut config = Config::default();
        config.roles.approvers = vec!["AC".to_string()];
        config
    }

    fn dashboard(fetcher: Arc<FakeFetcher>) -> Arc<Dashboard> {
        Dashboard::new(config(), Preferences::default(), fetcher)
    }

    async fn wait_feed(
        rx: &mut watch::Receiver<ActionFeed>,
        pred: impl FnMut(&ActionFeed) -> bool,
    ) -> ActionFeed {
        tokio::time::timeout(Duration::from_secs(30), rx.wait_for(pred))
            .await
            .expect("feed did not reach expected state")
            .expect("feed closed")
            .clone()
    }

    fn titles(feed: &ActionFeed) -> Vec<&str> {
        feed.items.iter().map(|i| i.title.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_switch_clears_previous_user() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.script(
            Domain::AnnualLeave,
            FakeReply::ok_after(
                leave_state(vec![leave("l1", "LZ", LeaveStatus::Requested, &["AC"])]),
                10,
            ),
        );
        let dash = dashboard(Arc::clone(&fetcher));
        let a = identity("ac@example.com", "AC");
        let b = identity("jw@example.com", "JW");

        dash.set_identity(a.clone()).unwrap().join().await;
        let mut feed = dash.actions();
        wait_feed(&mut feed, |f| f.items.iter().any(|i| i.title == APPROVE_LEAVE)).await;

        dash.set_identity(b).unwrap();
        for domain in Domain::ALL {
            assert!(dash.cache().read(domain, &a.fingerprint()).is_none());
        }
        assert!(!titles(&dash.current_feed()).contains(&APPROVE_LEAVE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_for_old_identity_is_discarded() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.script(
            Domain::Instructions,
            FakeReply::ok_after(review_queue(vec![review("i1", "Smith", "Verify ID")]), 100),
        );
        let dash = dashboard(Arc::clone(&fetcher));
        let a = identity("ac@example.com", "AC");
        let b = identity("jw@example.com", "JW");

        let _run_a = dash.set_identity(a.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        dash.set_identity(b.clone()).unwrap().join().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(dash.cache().read(Domain::Instructions, &a.fingerprint()).is_none());
        assert!(dash.cache().read(Domain::Instructions, &b.fingerprint()).is_some());
        assert!(!titles(&dash.current_feed()).contains(&"Verify ID"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_identity_is_noop() {
        let fetcher = Arc::new(FakeFetcher::new());
        let dash = dashboard(Arc::clone(&fetcher));
        let a = identity("ac@example.com", "AC");

        assert!(dash.set_identity(a.clone()).is_some());
        assert!(dash.set_identity(a).is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls(Domain::Attendance), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_waits_for_identity() {
        let dash = dashboard(Arc::new(FakeFetcher::new()));
        let feed = dash.current_feed();
        assert!(!feed.ready);
        assert!(feed.loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_attendance_confirmation() {
        let fetcher = Arc::new(FakeFetcher::new());
        let dash = dashboard(Arc::clone(&fetcher));
        let week = dash.relevant_week();
        let unconfirmed = DomainPayload::Attendance(AttendanceState {
            records: vec![attendance_record("AC", week, false)],
        });
        let confirmed = DomainPayload::Attendance(AttendanceState {
            records: vec![attendance_record("AC", week, true)],
        });
        fetcher.script(Domain::Attendance, FakeReply::ok_after(unconfirmed, 10));
        fetcher.script_forced(Domain::Attendance, FakeReply::ok_after(confirmed.clone(), 50));

        let a = identity("ac@example.com", "AC");
        dash.set_identity(a.clone()).unwrap().join().await;
        let mut feed = dash.actions();
        wait_feed(&mut feed, |f| f.items.iter().any(|i| i.title == CONFIRM_ATTENDANCE)).await;

        let pending = dash.confirm_attendance().unwrap();
        let tentative = dash.cache().read(Domain::Attendance, &a.fingerprint()).unwrap();
        assert!(!tentative.confirmed);
        wait_feed(&mut feed, |f| !f.items.iter().any(|i| i.title == CONFIRM_ATTENDANCE)).await;

        assert!(pending.wait().await.is_ok());
        let settled = dash.cache().read(Domain::Attendance, &a.fingerprint()).unwrap();
        assert!(settled.confirmed);
        assert_eq!(settled.value(), Some(&confirmed));
        assert_eq!(fetcher.forced_calls(Domain::Attendance), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_write_without_identity_is_ignored() {
        let dash = dashboard(Arc::new(FakeFetcher::new()));
        assert!(dash.confirm_attendance().is_none());
        assert!(dash.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_publishes_dispatch_events() {
        let dash = dashboard(Arc::new(FakeFetcher::new()));
        let mut sub = dash.bus().subscribe();
        let item = ActionItem {
            title: "Review Instruction".to_string(),
            subtitle: None,
            category: crate::types::ActionCategory::Standard,
            count: Some(1),
            activation: ActionActivation::Navigate {
                tab: "instructions".to_string(),
            },
        };

        dash.activate(&item);
        let types: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.event_type())
            .collect();
        assert_eq!(types, vec!["navigate", "action_activated"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_mode_replaces_live_actions() {
        let dash = dashboard(Arc::new(FakeFetcher::new()));
        dash.set_demo_mode(true);
        let feed = dash.current_feed();
        assert!(feed.ready);
        assert_eq!(feed.items, demo_actions());

        dash.set_demo_mode(false);
        assert!(dash.current_feed().items.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preference_changes_are_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("preferences.json");
        let dash = dashboard(Arc::new(FakeFetcher::new()));

        // Nothing is written until a path is set
        dash.set_actions_collapsed(true);
        assert!(!path.exists());

        dash.set_preferences_path(path.clone());
        dash.set_demo_mode(true);
        let saved = crate::prefs::load_preferences(&path);
        assert!(saved.actions_collapsed);
        assert!(saved.demo_mode);

        dash.set_actions_collapsed(false);
        assert!(!crate::prefs::load_preferences(&path).actions_collapsed);
        assert!(!dash.preferences().actions_collapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_warm_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");
        let a = identity("ac@example.com", "AC");

        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.script(
            Domain::Instructions,
            FakeReply::ok_after(review_queue(vec![review("i1", "Smith", "Verify ID")]), 10),
        );
        let first = dashboard(Arc::clone(&fetcher));
        first.set_identity(a.clone()).unwrap().join().await;
        assert_eq!(first.save_snapshot(&path).unwrap(), Domain::ALL.len());
        first.shutdown();

        let second = dashboard(Arc::new(FakeFetcher::new().with_default_delay(1_000)));
        assert_eq!(second.load_snapshot(&path).unwrap(), Domain::ALL.len());
        second.set_identity(a).unwrap();
        // Cached values show while the reload is still in flight
        assert!(titles(&second.current_feed()).contains(&"Verify ID"));
        assert_eq!(fetcher.calls(Domain::Instructions), 1);
    }
}
