//! Immediate actions derived from the shared cache.
//!
//! `derive_actions` is a pure function of a cache snapshot plus the user's
//! static role facts. Each domain contributes independently: a domain that is
//! still loading or unavailable adds nothing, and never holds back the others.
//! Instances of the same action collapse into one item with a count, then
//! the list is stably sorted by the static priority table.

pub mod priority;
pub mod week;

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::cache::{CacheSnapshot, DomainState};
use crate::config::Environment;
use crate::types::{
    normalize_initials, ActionActivation, ActionCategory, ActionItem, Domain, DomainPayload,
    DomainRecord, LeaveStatus, UserIdentity,
};

use priority::{
    priority_of, ALLOCATE_DOCUMENTS, APPROVE_LEAVE, APPROVE_SNIPPET_EDITS, BOOK_LEAVE,
    CONFIRM_ATTENDANCE, LOCAL_TEST_ACTION,
};

/// Domains whose state feeds the action list.
pub const ACTION_DOMAINS: [Domain; 5] = [
    Domain::Attendance,
    Domain::AnnualLeave,
    Domain::Instructions,
    Domain::DocumentAllocation,
    Domain::SnippetEdits,
];

/// Static facts the deriver needs besides the cache.
#[derive(Debug, Clone)]
pub struct DeriveContext<'a> {
    pub identity: &'a UserIdentity,
    /// Initials allowed to see approval actions.
    pub approvers: &'a [String],
    pub environment: Environment,
    pub demo_mode: bool,
    /// Monday of the week attendance must be confirmed for.
    pub relevant_week: NaiveDate,
}

impl DeriveContext<'_> {
    fn is_approver(&self) -> bool {
        let me = self.identity.normalized_initials();
        self.approvers.iter().any(|a| normalize_initials(a) == me)
    }
}

/// One underlying instance before grouping.
struct Candidate {
    title: String,
    label: Option<String>,
    category: ActionCategory,
    counted: bool,
    activation: ActionActivation,
}

/// Derive the ordered, deduplicated action list.
pub fn derive_actions(snapshot: &CacheSnapshot, ctx: &DeriveContext<'_>) -> Vec<ActionItem> {
    if ctx.demo_mode {
        return demo_actions();
    }

    let mut candidates = Vec::new();
    attendance_candidates(snapshot, ctx, &mut candidates);
    leave_candidates(snapshot, ctx, &mut candidates);
    review_candidates(snapshot, ctx, &mut candidates);

    if ctx.environment == Environment::Local {
        candidates.push(Candidate {
            title: LOCAL_TEST_ACTION.to_string(),
            label: Some("Local environment only".to_string()),
            category: ActionCategory::Standard,
            counted: false,
            activation: ActionActivation::Navigate {
                tab: "home".to_string(),
            },
        });
    }

    let mut items = group_candidates(candidates);
    // Vec::sort_by_key is stable: equal ranks keep discovery order
    items.sort_by_key(|item| priority_of(&item.title));
    items
}

fn attendance_candidates(snapshot: &CacheSnapshot, ctx: &DeriveContext<'_>, out: &mut Vec<Candidate>) {
    let state = match snapshot.state(Domain::Attendance) {
        DomainState::Ready(DomainPayload::Attendance(state)) => state,
        _ => return,
    };

    let confirmed = state.records.iter().any(|record| {
        record.week_start == ctx.relevant_week
            && record.is_owned_by(&ctx.identity.initials)
            && record.is_confirmed()
    });
    if confirmed {
        return;
    }

    out.push(Candidate {
        title: CONFIRM_ATTENDANCE.to_string(),
        label: Some(format!("Week of {}", ctx.relevant_week.format("%-d %b"))),
        category: ActionCategory::Critical,
        counted: false,
        activation: ActionActivation::ConfirmAttendance {
            week_start: ctx.relevant_week,
        },
    });
}

fn leave_candidates(snapshot: &CacheSnapshot, ctx: &DeriveContext<'_>, out: &mut Vec<Candidate>) {
    let state = match snapshot.state(Domain::AnnualLeave) {
        DomainState::Ready(DomainPayload::AnnualLeave(state)) => state,
        _ => return,
    };
    let me = &ctx.identity.initials;

    if ctx.is_approver() {
        for record in state.records.iter().filter(|r| {
            r.status == LeaveStatus::Requested && r.is_addressed_to(me) && !r.is_owned_by(me)
        }) {
            out.push(Candidate {
                title: APPROVE_LEAVE.to_string(),
                label: Some(leave_label(&record.owner_initials, record.start_date, record.end_date)),
                category: ActionCategory::Critical,
                counted: true,
                activation: ActionActivation::ApproveLeave,
            });
        }
    }

    for record in state
        .records
        .iter()
        .filter(|r| r.status == LeaveStatus::Approved && r.is_owned_by(me))
    {
        out.push(Candidate {
            title: BOOK_LEAVE.to_string(),
            label: Some(leave_label(&record.owner_initials, record.start_date, record.end_date)),
            category: ActionCategory::Standard,
            counted: true,
            activation: ActionActivation::BookLeave,
        });
    }
}

fn leave_label(owner: &str, start: NaiveDate, end: NaiveDate) -> String {
    if start == end {
        format!("{} {}", owner, start.format("%-d %b"))
    } else {
        format!("{} {} - {}", owner, start.format("%-d %b"), end.format("%-d %b"))
    }
}

fn review_candidates(snapshot: &CacheSnapshot, ctx: &DeriveContext<'_>, out: &mut Vec<Candidate>) {
    if let DomainState::Ready(DomainPayload::Review(queue)) = snapshot.state(Domain::Instructions) {
        for item in &queue.items {
            let next_action = item.next_action.trim();
            if next_action.is_empty() {
                continue;
            }
            out.push(Candidate {
                title: next_action.to_string(),
                label: Some(item.label.clone()),
                category: ActionCategory::Standard,
                counted: true,
                activation: ActionActivation::OpenInstruction {
                    next_action: next_action.to_string(),
                    first_ref: item.id.clone(),
                },
            });
        }
    }

    if let DomainState::Ready(DomainPayload::Review(queue)) =
        snapshot.state(Domain::DocumentAllocation)
    {
        for item in &queue.items {
            out.push(Candidate {
                title: ALLOCATE_DOCUMENTS.to_string(),
                label: Some(item.label.clone()),
                category: ActionCategory::Standard,
                counted: true,
                activation: ActionActivation::AllocateDocuments,
            });
        }
    }

    if !ctx.is_approver() {
        return;
    }
    if let DomainState::Ready(DomainPayload::Review(queue)) = snapshot.state(Domain::SnippetEdits) {
        for item in &queue.items {
            out.push(Candidate {
                title: APPROVE_SNIPPET_EDITS.to_string(),
                label: Some(item.label.clone()),
                category: ActionCategory::Standard,
                counted: true,
                activation: ActionActivation::ApproveSnippetEdits,
            });
        }
    }
}

/// Merge candidates sharing a title, keeping first-seen order.
fn group_candidates(candidates: Vec<Candidate>) -> Vec<ActionItem> {
    struct Group {
        first: Candidate,
        count: usize,
    }

    let mut order: Vec<Group> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for candidate in candidates {
        match index.get(&candidate.title) {
            Some(&i) => order[i].count += 1,
            None => {
                index.insert(candidate.title.clone(), order.len());
                order.push(Group {
                    first: candidate,
                    count: 1,
                });
            }
        }
    }

    order
        .into_iter()
        .map(|Group { first, count }| {
            let subtitle = match (first.label, count) {
                (Some(label), 1) => Some(label),
                (Some(label), n) => Some(format!("{} (+{} more)", label, n - 1)),
                (None, 1) => None,
                (None, n) => Some(format!("{} items", n)),
            };
            ActionItem {
                title: first.title,
                subtitle,
                category: first.category,
                count: (first.counted || count > 1).then_some(count),
                activation: first.activation,
            }
        })
        .collect()
}

/// Fixed illustrative actions shown in demo mode.
pub fn demo_actions() -> Vec<ActionItem> {
    let mut items = vec![
        ActionItem {
            title: CONFIRM_ATTENDANCE.to_string(),
            subtitle: Some("Week of 3 Mar".to_string()),
            category: ActionCategory::Critical,
            count: None,
            activation: ActionActivation::Demo,
        },
        ActionItem {
            title: "Verify ID".to_string(),
            subtitle: Some("Demo Client Ltd (+2 more)".to_string()),
            category: ActionCategory::Standard,
            count: Some(3),
            activation: ActionActivation::Demo,
        },
        ActionItem {
            title: APPROVE_LEAVE.to_string(),
            subtitle: Some("JD 10 Mar - 12 Mar (+1 more)".to_string()),
            category: ActionCategory::Critical,
            count: Some(2),
            activation: ActionActivation::Demo,
        },
        ActionItem {
            title: ALLOCATE_DOCUMENTS.to_string(),
            subtitle: Some("Engagement letter.pdf".to_string()),
            category: ActionCategory::Standard,
            count: Some(1),
            activation: ActionActivation::Demo,
        },
    ];
    items.sort_by_key(|item| priority_of(&item.title));
    items
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

/// What the presentation bar consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFeed {
    pub items: Vec<ActionItem>,
    /// Every action domain has settled, or the loading flag was cleared.
    pub ready: bool,
    pub loading: bool,
    pub empty: bool,
}

pub fn derive_feed(snapshot: &CacheSnapshot, ctx: &DeriveContext<'_>, loading: bool) -> ActionFeed {
    let items = derive_actions(snapshot, ctx);
    let settled = ACTION_DOMAINS.iter().all(|d| snapshot.is_settled(*d));
    let ready = ctx.demo_mode || settled || !loading;
    ActionFeed {
        empty: items.is_empty(),
        ready,
        loading: loading && !ready,
        items,
    }
}
