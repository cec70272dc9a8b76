use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Domains and keys
// ---------------------------------------------------------------------------

/// One independent backend feed behind the home dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Domain {
    Attendance,
    AnnualLeave,
    TimeTotals,
    EnquiryCounts,
    Instructions,
    DocumentAllocation,
    SnippetEdits,
}

impl Domain {
    pub const ALL: [Domain; 7] = [
        Domain::Attendance,
        Domain::AnnualLeave,
        Domain::TimeTotals,
        Domain::EnquiryCounts,
        Domain::Instructions,
        Domain::DocumentAllocation,
        Domain::SnippetEdits,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Attendance => "attendance",
            Domain::AnnualLeave => "annual-leave",
            Domain::TimeTotals => "time-totals",
            Domain::EnquiryCounts => "enquiry-counts",
            Domain::Instructions => "instructions",
            Domain::DocumentAllocation => "document-allocation",
            Domain::SnippetEdits => "snippet-edits",
        }
    }

    /// Domains the backend publishes change streams for.
    pub fn supports_push(&self) -> bool {
        !matches!(self, Domain::TimeTotals | Domain::EnquiryCounts)
    }

    /// Domains whose endpoint honours `forceRefresh` to skip the server cache.
    pub fn accepts_force_refresh(&self) -> bool {
        matches!(
            self,
            Domain::TimeTotals | Domain::EnquiryCounts | Domain::Instructions
        )
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resolved user the dashboard is showing data for.
///
/// An admin "view as" switch is just a different identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub email: String,
    pub internal_id: String,
    pub initials: String,
    #[serde(default)]
    pub full_name: String,
}

impl UserIdentity {
    pub fn fingerprint(&self) -> IdentityFingerprint {
        IdentityFingerprint::from_identity(self)
    }

    /// Initials normalised for comparisons against record owners/approvers.
    pub fn normalized_initials(&self) -> String {
        normalize_initials(&self.initials)
    }
}

pub fn normalize_initials(value: &str) -> String {
    value.trim().to_uppercase()
}

/// Stable hash of a user's identifiers, used in cache and in-flight keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityFingerprint(String);

impl IdentityFingerprint {
    pub fn from_identity(identity: &UserIdentity) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(identity.email.trim().to_lowercase().as_bytes());
        hasher.update(b"|");
        hasher.update(identity.internal_id.trim().as_bytes());
        let digest = hex::encode(hasher.finalize());
        IdentityFingerprint(digest[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one coalesced logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchKey {
    pub domain: Domain,
    pub fingerprint: IdentityFingerprint,
}

impl FetchKey {
    pub fn new(domain: Domain, fingerprint: IdentityFingerprint) -> Self {
        Self {
            domain,
            fingerprint,
        }
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.fingerprint)
    }
}

/// Strictly increasing token for one fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Domain records
// ---------------------------------------------------------------------------

/// Shape shared by every record the deriver inspects.
pub trait DomainRecord {
    fn status(&self) -> &str;
    fn effective_date(&self) -> Option<NaiveDate>;
    fn owner(&self) -> Option<&str>;

    fn is_owned_by(&self, initials: &str) -> bool {
        self.owner()
            .map(|owner| normalize_initials(owner) == normalize_initials(initials))
            .unwrap_or(false)
    }
}

/// One person's declared attendance for a week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    #[serde(alias = "initials")]
    pub owner_initials: String,
    pub week_start: NaiveDate,
    /// Status per weekday, Monday first (e.g. "office", "home", "away").
    #[serde(default)]
    pub days: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl AttendanceRecord {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }
}

impl DomainRecord for AttendanceRecord {
    fn status(&self) -> &str {
        if self.is_confirmed() {
            "confirmed"
        } else {
            "unconfirmed"
        }
    }

    fn effective_date(&self) -> Option<NaiveDate> {
        Some(self.week_start)
    }

    fn owner(&self) -> Option<&str> {
        Some(&self.owner_initials)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveStatus {
    Requested,
    Approved,
    Rejected,
    Booked,
}

impl LeaveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveStatus::Requested => "requested",
            LeaveStatus::Approved => "approved",
            LeaveStatus::Rejected => "rejected",
            LeaveStatus::Booked => "booked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRecord {
    pub id: String,
    #[serde(alias = "person")]
    pub owner_initials: String,
    pub status: LeaveStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub approvers: Vec<String>,
}

impl LeaveRecord {
    pub fn is_addressed_to(&self, initials: &str) -> bool {
        let initials = normalize_initials(initials);
        self.approvers
            .iter()
            .any(|approver| normalize_initials(approver) == initials)
    }
}

impl DomainRecord for LeaveRecord {
    fn status(&self) -> &str {
        self.status.as_str()
    }

    fn effective_date(&self) -> Option<NaiveDate> {
        Some(self.start_date)
    }

    fn owner(&self) -> Option<&str> {
        Some(&self.owner_initials)
    }
}

/// A pending instruction, document or snippet that needs someone to act.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: String,
    /// Identifying label shown in subtitles (client name, reference, file name).
    pub label: String,
    pub next_action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_initials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl DomainRecord for ReviewItem {
    fn status(&self) -> &str {
        &self.next_action
    }

    fn effective_date(&self) -> Option<NaiveDate> {
        self.created_at.map(|dt| dt.date_naive())
    }

    fn owner(&self) -> Option<&str> {
        self.owner_initials.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceState {
    pub records: Vec<AttendanceRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveState {
    pub records: Vec<LeaveRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeTotals {
    #[serde(default)]
    pub recorded_hours: f64,
    #[serde(default)]
    pub billed_hours: f64,
    #[serde(default)]
    pub wip_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_start: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnquiryCounts {
    #[serde(default)]
    pub today: u32,
    #[serde(default)]
    pub this_week: u32,
    #[serde(default)]
    pub this_month: u32,
    #[serde(default)]
    pub unclaimed: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewQueue {
    pub items: Vec<ReviewItem>,
}

/// Decoded value of one domain fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum DomainPayload {
    Attendance(AttendanceState),
    AnnualLeave(LeaveState),
    TimeTotals(TimeTotals),
    EnquiryCounts(EnquiryCounts),
    Review(ReviewQueue),
}

/// Endpoints answer either a bare array or `{ "records": [...] }` / `{ "items": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody<T> {
    List(Vec<T>),
    Wrapped {
        #[serde(alias = "records", alias = "data")]
        items: Vec<T>,
    },
}

impl<T> ListBody<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            ListBody::List(items) => items,
            ListBody::Wrapped { items } => items,
        }
    }
}

impl DomainPayload {
    /// Decode a raw endpoint body for `domain`.
    pub fn decode(domain: Domain, body: serde_json::Value) -> Result<Self, SyncError> {
        let payload = match domain {
            Domain::Attendance => DomainPayload::Attendance(AttendanceState {
                records: serde_json::from_value::<ListBody<AttendanceRecord>>(body)?.into_vec(),
            }),
            Domain::AnnualLeave => DomainPayload::AnnualLeave(LeaveState {
                records: serde_json::from_value::<ListBody<LeaveRecord>>(body)?.into_vec(),
            }),
            Domain::TimeTotals => DomainPayload::TimeTotals(serde_json::from_value(body)?),
            Domain::EnquiryCounts => DomainPayload::EnquiryCounts(serde_json::from_value(body)?),
            Domain::Instructions | Domain::DocumentAllocation | Domain::SnippetEdits => {
                DomainPayload::Review(ReviewQueue {
                    items: serde_json::from_value::<ListBody<ReviewItem>>(body)?.into_vec(),
                })
            }
        };
        Ok(payload)
    }

    /// Whether this payload is the right shape for `domain`.
    pub fn fits(&self, domain: Domain) -> bool {
        matches!(
            (self, domain),
            (DomainPayload::Attendance(_), Domain::Attendance)
                | (DomainPayload::AnnualLeave(_), Domain::AnnualLeave)
                | (DomainPayload::TimeTotals(_), Domain::TimeTotals)
                | (DomainPayload::EnquiryCounts(_), Domain::EnquiryCounts)
                | (
                    DomainPayload::Review(_),
                    Domain::Instructions | Domain::DocumentAllocation | Domain::SnippetEdits
                )
        )
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionCategory {
    Critical,
    Standard,
    Success,
}

/// What activating an action asks the host to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActionActivation {
    #[serde(rename_all = "camelCase")]
    ConfirmAttendance { week_start: NaiveDate },
    ApproveLeave,
    BookLeave,
    #[serde(rename_all = "camelCase")]
    OpenInstruction {
        next_action: String,
        first_ref: String,
    },
    AllocateDocuments,
    ApproveSnippetEdits,
    Navigate { tab: String },
    Demo,
}

/// One "needs attention" entry, possibly standing for several instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionItem {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub category: ActionCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    pub activation: ActionActivation,
}
