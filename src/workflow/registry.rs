//! Static table of legal workflow edges.
//!
//! The table is the single source of truth for topology. Changing it is a
//! reviewed code change; nothing mutates it at runtime.

use std::sync::LazyLock;

use super::types::{ProposalState, Role, WorkflowAction};

use ProposalState as S;
use WorkflowAction as A;

/// One legal `(from, action) -> to` edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ProposalState,
    pub to: ProposalState,
    pub action: WorkflowAction,
    /// `None` means any role may take the edge.
    pub allowed_roles: Option<&'static [Role]>,
}

const OWNER: &[Role] = &[Role::GiangVien];
const FACULTY_REVIEWERS: &[Role] = &[Role::QuanLyKhoa, Role::ThuKyKhoa];
const CENTRAL_OFFICE: &[Role] = &[Role::PhongKhcn];
const COUNCIL: &[Role] = &[Role::ThuKyHoiDong, Role::BanGiamHoc, Role::Bgh];
const SCHOOL_ACCEPTORS: &[Role] = &[Role::PhongKhcn, Role::BanGiamHoc, Role::Bgh];
const OWNER_OR_OFFICE: &[Role] = &[Role::GiangVien, Role::PhongKhcn];

const REJECT_AT_FACULTY: &[Role] = &[Role::QuanLyKhoa, Role::PhongKhcn, Role::BanGiamHoc];
const REJECT_AT_SELECTION: &[Role] = &[Role::PhongKhcn, Role::BanGiamHoc];
const REJECT_AT_COUNCIL: &[Role] = &[Role::ThuKyHoiDong, Role::ThanhTrung, Role::BanGiamHoc];
const REJECT_AT_CHANGES: &[Role] = &[Role::QuanLyKhoa, Role::PhongKhcn, Role::BanGiamHoc];

/// States a proposal can be paused from, and resumed back into.
pub const PAUSABLE_STATES: &[ProposalState] = &[
    S::Draft,
    S::FacultyReview,
    S::SchoolSelectionReview,
    S::OutlineCouncilReview,
    S::ChangesRequested,
    S::Approved,
    S::InProgress,
    S::FacultyAcceptanceReview,
    S::SchoolAcceptanceReview,
    S::Handover,
];

/// States a changes-requested proposal may be resubmitted into.
pub const RESUBMIT_TARGETS: &[ProposalState] = &[
    S::FacultyReview,
    S::OutlineCouncilReview,
    S::FacultyAcceptanceReview,
    S::SchoolAcceptanceReview,
];

pub const TERMINAL_STATES: &[ProposalState] =
    &[S::Completed, S::Cancelled, S::Rejected, S::Withdrawn];

const fn edge(
    from: ProposalState,
    to: ProposalState,
    action: WorkflowAction,
    roles: &'static [Role],
) -> Transition {
    Transition {
        from,
        to,
        action,
        allowed_roles: Some(roles),
    }
}

static TRANSITIONS: LazyLock<Vec<Transition>> = LazyLock::new(|| {
    let mut edges = vec![
        // Outline phase
        edge(S::Draft, S::FacultyReview, A::Submit, OWNER),
        edge(S::FacultyReview, S::SchoolSelectionReview, A::Approve, FACULTY_REVIEWERS),
        edge(S::FacultyReview, S::ChangesRequested, A::Return, FACULTY_REVIEWERS),
        edge(S::SchoolSelectionReview, S::OutlineCouncilReview, A::AssignCouncil, CENTRAL_OFFICE),
        edge(S::OutlineCouncilReview, S::Approved, A::Approve, COUNCIL),
        edge(S::OutlineCouncilReview, S::ChangesRequested, A::Return, COUNCIL),
        // Execution and acceptance phase
        edge(S::Approved, S::InProgress, A::StartProject, OWNER_OR_OFFICE),
        edge(S::InProgress, S::FacultyAcceptanceReview, A::SubmitAcceptance, OWNER),
        edge(S::FacultyAcceptanceReview, S::SchoolAcceptanceReview, A::FacultyAccept, FACULTY_REVIEWERS),
        edge(S::FacultyAcceptanceReview, S::ChangesRequested, A::Return, FACULTY_REVIEWERS),
        edge(S::SchoolAcceptanceReview, S::Handover, A::Accept, SCHOOL_ACCEPTORS),
        edge(S::SchoolAcceptanceReview, S::ChangesRequested, A::Return, SCHOOL_ACCEPTORS),
        edge(S::Handover, S::Completed, A::HandoverComplete, OWNER_OR_OFFICE),
        edge(S::Handover, S::Completed, A::Finalize, OWNER_OR_OFFICE),
        // Exceptions
        edge(S::Draft, S::Cancelled, A::Cancel, OWNER),
        edge(S::Paused, S::Cancelled, A::Cancel, OWNER),
        edge(S::FacultyReview, S::Withdrawn, A::Withdraw, OWNER),
        edge(S::SchoolSelectionReview, S::Withdrawn, A::Withdraw, OWNER),
        edge(S::OutlineCouncilReview, S::Withdrawn, A::Withdraw, OWNER),
        edge(S::ChangesRequested, S::Withdrawn, A::Withdraw, OWNER),
        edge(S::FacultyReview, S::Rejected, A::Reject, REJECT_AT_FACULTY),
        edge(S::SchoolSelectionReview, S::Rejected, A::Reject, REJECT_AT_SELECTION),
        edge(S::OutlineCouncilReview, S::Rejected, A::Reject, REJECT_AT_COUNCIL),
        edge(S::ChangesRequested, S::Rejected, A::Reject, REJECT_AT_CHANGES),
    ];

    edges.extend(
        RESUBMIT_TARGETS
            .iter()
            .map(|&target| edge(S::ChangesRequested, target, A::Resubmit, OWNER)),
    );

    for &state in PAUSABLE_STATES {
        edges.push(edge(state, S::Paused, A::Pause, CENTRAL_OFFICE));
        edges.push(edge(S::Paused, state, A::Resume, CENTRAL_OFFICE));
    }

    edges
});

/// Every legal edge.
pub fn transitions() -> &'static [Transition] {
    &TRANSITIONS
}

fn find(from: ProposalState, to: ProposalState, action: WorkflowAction) -> Option<&'static Transition> {
    TRANSITIONS
        .iter()
        .find(|t| t.from == from && t.to == to && t.action == action)
}

pub fn is_valid_transition(from: ProposalState, to: ProposalState, action: WorkflowAction) -> bool {
    find(from, to, action).is_some()
}

/// Targets reachable from `from` via `action`, in table order.
pub fn valid_next_states(from: ProposalState, action: WorkflowAction) -> Vec<ProposalState> {
    TRANSITIONS
        .iter()
        .filter(|t| t.from == from && t.action == action)
        .map(|t| t.to)
        .collect()
}

/// Actions with at least one outgoing edge from `from`.
pub fn available_actions(from: ProposalState) -> Vec<WorkflowAction> {
    let mut actions: Vec<WorkflowAction> = TRANSITIONS
        .iter()
        .filter(|t| t.from == from)
        .map(|t| t.action)
        .collect();
    actions.sort();
    actions.dedup();
    actions
}

pub fn is_terminal(state: ProposalState) -> bool {
    TERMINAL_STATES.contains(&state)
}

/// Roles allowed on the edge; `None` if unrestricted or if the edge does not exist.
pub fn allowed_roles(
    from: ProposalState,
    to: ProposalState,
    action: WorkflowAction,
) -> Option<&'static [Role]> {
    find(from, to, action).and_then(|t| t.allowed_roles)
}
