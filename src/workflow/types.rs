use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declares a wire-named enum with `as_str`, `Display`, `FromStr` and `ALL`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $wire)] $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

wire_enum! {
    /// Lifecycle state of a proposal. Submission is an action, never a state.
    pub enum ProposalState {
        Draft => "DRAFT",
        FacultyReview => "FACULTY_REVIEW",
        SchoolSelectionReview => "SCHOOL_SELECTION_REVIEW",
        OutlineCouncilReview => "OUTLINE_COUNCIL_REVIEW",
        ChangesRequested => "CHANGES_REQUESTED",
        Approved => "APPROVED",
        InProgress => "IN_PROGRESS",
        FacultyAcceptanceReview => "FACULTY_ACCEPTANCE_REVIEW",
        SchoolAcceptanceReview => "SCHOOL_ACCEPTANCE_REVIEW",
        Handover => "HANDOVER",
        Completed => "COMPLETED",
        Paused => "PAUSED",
        Cancelled => "CANCELLED",
        Rejected => "REJECTED",
        Withdrawn => "WITHDRAWN",
    }
}

wire_enum! {
    pub enum WorkflowAction {
        Submit => "SUBMIT",
        Approve => "APPROVE",
        Return => "RETURN",
        Resubmit => "RESUBMIT",
        AssignCouncil => "ASSIGN_COUNCIL",
        StartProject => "START_PROJECT",
        SubmitAcceptance => "SUBMIT_ACCEPTANCE",
        FacultyAccept => "FACULTY_ACCEPT",
        Accept => "ACCEPT",
        Finalize => "FINALIZE",
        HandoverComplete => "HANDOVER_COMPLETE",
        Cancel => "CANCEL",
        Withdraw => "WITHDRAW",
        Reject => "REJECT",
        Pause => "PAUSE",
        Resume => "RESUME",
    }
}

wire_enum! {
    /// Roles supplied by the identity provider.
    pub enum Role {
        /// Lecturer, the proposal owner.
        GiangVien => "GIANG_VIEN",
        /// Faculty manager.
        QuanLyKhoa => "QUAN_LY_KHOA",
        /// Faculty secretary.
        ThuKyKhoa => "THU_KY_KHOA",
        /// Council secretary.
        ThuKyHoiDong => "THU_KY_HOI_DONG",
        /// Board of rectors.
        BanGiamHoc => "BAN_GIAM_HOC",
        Bgh => "BGH",
        /// Central science office.
        PhongKhcn => "PHONG_KHCN",
        /// Council member.
        ThanhTrung => "THANH_TRUNG",
        Admin => "ADMIN",
    }
}

wire_enum! {
    pub enum ReturnReasonCode {
        MissingDocuments => "THIEU_TAI_LIEU",
        UnclearContent => "NOI_DUNG_KHONG_RO_RANG",
        InfeasibleMethod => "PHUONG_PHAP_KHONG_KHA_THI",
        UnreasonableBudget => "KINH_PHI_KHONG_HOP_LE",
        Other => "KHAC",
    }
}

wire_enum! {
    pub enum RejectReasonCode {
        NotScientific => "NOT_SCIENTIFIC",
        NotFeasible => "NOT_FEASIBLE",
        OutOfScope => "OUT_OF_SCOPE",
        BudgetExceeded => "BUDGET_EXCEEDED",
        Duplicate => "DUPLICATE",
        Other => "OTHER",
    }
}

/// A research proposal moving through the approval workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    pub code: String,
    pub title: String,
    pub state: ProposalState,
    pub owner_id: String,
    pub faculty_id: String,
    pub holder_unit: Option<String>,
    pub holder_user: Option<String>,
    pub sla_start_date: Option<DateTime<Utc>>,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub pre_pause_state: Option<ProposalState>,
    pub pre_pause_holder_unit: Option<String>,
    pub pre_pause_holder_user: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    /// A fresh draft held by nobody.
    pub fn draft(
        id: impl Into<String>,
        code: impl Into<String>,
        title: impl Into<String>,
        owner_id: impl Into<String>,
        faculty_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            title: title.into(),
            state: ProposalState::Draft,
            owner_id: owner_id.into(),
            faculty_id: faculty_id.into(),
            holder_unit: None,
            holder_user: None,
            sla_start_date: None,
            sla_deadline: None,
            pre_pause_state: None,
            pre_pause_holder_unit: None,
            pre_pause_holder_user: None,
            paused_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Append-only history record, one per committed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowLogEntry {
    pub id: String,
    pub proposal_id: String,
    pub action: WorkflowAction,
    pub from_state: ProposalState,
    pub to_state: ProposalState,
    pub actor_id: String,
    pub actor_name: String,
    pub return_target_state: Option<ProposalState>,
    pub return_target_holder_unit: Option<String>,
    pub reason_code: Option<String>,
    pub comment: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// The acting principal, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
    pub faculty_id: Option<String>,
    pub display_name: Option<String>,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            faculty_id: None,
            display_name: None,
        }
    }

    pub fn with_faculty(mut self, faculty_id: impl Into<String>) -> Self {
        self.faculty_id = Some(faculty_id.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name recorded in the log; falls back to the user id.
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.user_id)
    }
}

/// Request-scoped data that travels with a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionContext {
    pub actor: Actor,
    pub idempotency_key: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
}

impl TransitionContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            idempotency_key: None,
            ip_address: None,
            user_agent: None,
            request_id: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Result of a committed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome {
    pub proposal: Proposal,
    pub log_entry: WorkflowLogEntry,
    pub previous_state: ProposalState,
    pub current_state: ProposalState,
    pub holder_unit: Option<String>,
    pub holder_user: Option<String>,
}

/// A value produced under an idempotency key, flagged when it was replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct Idempotent<T> {
    pub data: T,
    pub is_cached: bool,
}

impl<T> Idempotent<T> {
    pub fn fresh(data: T) -> Self {
        Self {
            data,
            is_cached: false,
        }
    }

    pub fn replayed(data: T) -> Self {
        Self {
            data,
            is_cached: true,
        }
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submitted_is_not_a_state() {
        assert!("SUBMITTED".parse::<ProposalState>().is_err());
        assert!(serde_json::from_str::<ProposalState>("\"SUBMITTED\"").is_err());
        assert_eq!(ProposalState::ALL.len(), 15);
    }

    #[test]
    fn wire_names_round_trip_through_serde() {
        for state in ProposalState::ALL {
            let json = serde_json::to_string(state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert_eq!(
            "SUBMIT_ACCEPTANCE".parse::<WorkflowAction>().unwrap(),
            WorkflowAction::SubmitAcceptance
        );
        assert_eq!("PHONG_KHCN".parse::<Role>().unwrap(), Role::PhongKhcn);
    }

    #[test]
    fn actor_name_falls_back_to_id() {
        let actor = Actor::new("u1", Role::GiangVien);
        assert_eq!(actor.name(), "u1");
        let named = actor.with_display_name("Nguyen Van A");
        assert_eq!(named.name(), "Nguyen Van A");
    }
}
