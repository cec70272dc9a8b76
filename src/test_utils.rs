//! Fixtures and fakes shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;

use crate::error::SyncError;
use crate::fetch::{DomainFetcher, FetchOptions};
use crate::types::{
    AttendanceRecord, AttendanceState, Domain, DomainPayload, EnquiryCounts, LeaveRecord,
    LeaveState, LeaveStatus, ReviewItem, ReviewQueue, TimeTotals, UserIdentity,
};

pub fn identity(email: &str, initials: &str) -> UserIdentity {
    UserIdentity {
        email: email.to_string(),
        internal_id: format!("id-{}", initials.to_lowercase()),
        initials: initials.to_string(),
        full_name: String::new(),
    }
}

/// Monday 2026-10-19, the week most tests run in.
pub fn week_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

pub fn attendance(initials: &str, confirmed: bool) -> DomainPayload {
    DomainPayload::Attendance(AttendanceState {
        records: vec![attendance_record(initials, week_start(), confirmed)],
    })
}

pub fn attendance_record(initials: &str, week_start: NaiveDate, confirmed: bool) -> AttendanceRecord {
    AttendanceRecord {
        owner_initials: initials.to_string(),
        week_start,
        days: vec!["office".to_string(); 5],
        confirmed_at: confirmed.then(|| Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()),
    }
}

pub fn leave(id: &str, owner: &str, status: LeaveStatus, approvers: &[&str]) -> LeaveRecord {
    LeaveRecord {
        id: id.to_string(),
        owner_initials: owner.to_string(),
        status,
        start_date: NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2026, 11, 4).unwrap(),
        approvers: approvers.iter().map(|a| a.to_string()).collect(),
    }
}

pub fn leave_state(records: Vec<LeaveRecord>) -> DomainPayload {
    DomainPayload::AnnualLeave(LeaveState { records })
}

pub fn review(id: &str, label: &str, next_action: &str) -> ReviewItem {
    ReviewItem {
        id: id.to_string(),
        label: label.to_string(),
        next_action: next_action.to_string(),
        owner_initials: None,
        created_at: None,
    }
}

pub fn review_queue(items: Vec<ReviewItem>) -> DomainPayload {
    DomainPayload::Review(ReviewQueue { items })
}

pub fn enquiry_counts(today: u32) -> DomainPayload {
    DomainPayload::EnquiryCounts(EnquiryCounts {
        today,
        ..Default::default()
    })
}

pub fn empty_payload(domain: Domain) -> DomainPayload {
    match domain {
        Domain::Attendance => DomainPayload::Attendance(AttendanceState::default()),
        Domain::AnnualLeave => DomainPayload::AnnualLeave(LeaveState::default()),
        Domain::TimeTotals => DomainPayload::TimeTotals(TimeTotals::default()),
        Domain::EnquiryCounts => DomainPayload::EnquiryCounts(EnquiryCounts::default()),
        Domain::Instructions | Domain::DocumentAllocation | Domain::SnippetEdits => {
            DomainPayload::Review(ReviewQueue::default())
        }
    }
}

// ---------------------------------------------------------------------------
// Fake fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum FakeResult {
    Ok(DomainPayload),
    Http(u16),
    Hang,
    Panic,
}

#[derive(Debug, Clone)]
pub struct FakeReply {
    pub delay: Duration,
    pub result: FakeResult,
}

impl FakeReply {
    pub fn ok_after(payload: DomainPayload, millis: u64) -> Self {
        Self {
            delay: Duration::from_millis(millis),
            result: FakeResult::Ok(payload),
        }
    }

    pub fn http(status: u16) -> Self {
        Self {
            delay: Duration::from_millis(5),
            result: FakeResult::Http(status),
        }
    }

    /// Simulates a fetcher bug that kills the fetch task.
    pub fn panic() -> Self {
        Self {
            delay: Duration::from_millis(5),
            result: FakeResult::Panic,
        }
    }

    pub fn hang() -> Self {
        Self {
            delay: Duration::ZERO,
            result: FakeResult::Hang,
        }
    }
}

/// Scripted fetcher that counts calls per domain.
///
/// Forced refreshes pop `script_forced` replies first, so tests can tell a
/// refetch apart from the initial load regardless of task scheduling.
pub struct FakeFetcher {
    scripts: Mutex<HashMap<Domain, VecDeque<FakeReply>>>,
    forced_scripts: Mutex<HashMap<Domain, VecDeque<FakeReply>>>,
    calls: Mutex<HashMap<Domain, usize>>,
    forced_calls: Mutex<HashMap<Domain, usize>>,
    fallback_calls: Mutex<HashMap<Domain, usize>>,
    fallbacks: HashSet<Domain>,
    default_delay: Duration,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            forced_scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            forced_calls: Mutex::new(HashMap::new()),
            fallback_calls: Mutex::new(HashMap::new()),
            fallbacks: HashSet::new(),
            default_delay: Duration::from_millis(10),
        }
    }

    pub fn with_default_delay(mut self, millis: u64) -> Self {
        self.default_delay = Duration::from_millis(millis);
        self
    }

    pub fn with_fallback(mut self, domain: Domain) -> Self {
        self.fallbacks.insert(domain);
        self
    }

    pub fn script(&self, domain: Domain, reply: FakeReply) {
        self.scripts.lock().entry(domain).or_default().push_back(reply);
    }

    pub fn script_forced(&self, domain: Domain, reply: FakeReply) {
        self.forced_scripts
            .lock()
            .entry(domain)
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self, domain: Domain) -> usize {
        self.calls.lock().get(&domain).copied().unwrap_or(0)
    }

    pub fn forced_calls(&self, domain: Domain) -> usize {
        self.forced_calls.lock().get(&domain).copied().unwrap_or(0)
    }

    pub fn fallback_calls(&self, domain: Domain) -> usize {
        self.fallback_calls.lock().get(&domain).copied().unwrap_or(0)
    }

    fn next_reply(&self, domain: Domain, forced: bool) -> FakeReply {
        let scripted = if forced {
            self.forced_scripts
                .lock()
                .get_mut(&domain)
                .and_then(VecDeque::pop_front)
        } else {
            None
        };
        scripted
            .or_else(|| self.scripts.lock().get_mut(&domain).and_then(VecDeque::pop_front))
            .unwrap_or_else(|| FakeReply {
                delay: self.default_delay,
                result: FakeResult::Ok(empty_payload(domain)),
            })
    }

    async fn play(reply: FakeReply) -> Result<DomainPayload, SyncError> {
        tokio::time::sleep(reply.delay).await;
        match reply.result {
            FakeResult::Ok(payload) => Ok(payload),
            FakeResult::Http(status) => Err(SyncError::Http {
                status,
                message: "scripted failure".to_string(),
            }),
            FakeResult::Hang => std::future::pending().await,
            FakeResult::Panic => panic!("scripted fetcher panic"),
        }
    }
}

#[async_trait]
impl DomainFetcher for FakeFetcher {
    async fn fetch(
        &self,
        domain: Domain,
        _identity: &UserIdentity,
        options: FetchOptions,
    ) -> Result<DomainPayload, SyncError> {
        *self.calls.lock().entry(domain).or_default() += 1;
        if options.force_refresh {
            *self.forced_calls.lock().entry(domain).or_default() += 1;
        }
        let reply = self.next_reply(domain, options.force_refresh);
        Self::play(reply).await
    }

    fn has_fallback(&self, domain: Domain) -> bool {
        self.fallbacks.contains(&domain)
    }

    async fn fetch_fallback(
        &self,
        domain: Domain,
        _identity: &UserIdentity,
    ) -> Result<DomainPayload, SyncError> {
        *self.fallback_calls.lock().entry(domain).or_default() += 1;
        Self::play(FakeReply {
            delay: self.default_delay,
            result: FakeResult::Ok(empty_payload(domain)),
        })
        .await
    }
}
