use serde::{Deserialize, Serialize};
use tracing::debug;

use super::registry;
use super::types::{Proposal, ProposalState, Role};

/// Unit code of the central science office unless configured otherwise.
pub const DEFAULT_CENTRAL_OFFICE_UNIT: &str = "PHONG_KHCN";

/// Who is responsible for acting on a proposal next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderAssignment {
    pub holder_unit: Option<String>,
    pub holder_user: Option<String>,
}

impl HolderAssignment {
    pub fn new(unit: Option<String>, user: Option<String>) -> Self {
        Self {
            holder_unit: unit,
            holder_user: user,
        }
    }

    pub fn unassigned() -> Self {
        Self::default()
    }

    pub fn unit(unit: impl Into<String>) -> Self {
        Self::new(Some(unit.into()), None)
    }
}

/// Maps a target state to its holder by a fixed per-state rule table.
#[derive(Debug, Clone)]
pub struct HolderResolver {
    central_office_unit: String,
}

impl Default for HolderResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CENTRAL_OFFICE_UNIT)
    }
}

impl HolderResolver {
    pub fn new(central_office_unit: impl Into<String>) -> Self {
        Self {
            central_office_unit: central_office_unit.into(),
        }
    }

    pub fn central_office_unit(&self) -> &str {
        &self.central_office_unit
    }

    /// Deterministic and side-effect free.
    pub fn resolve(
        &self,
        target: ProposalState,
        proposal: &Proposal,
        actor_id: Option<&str>,
        actor_unit: Option<&str>,
    ) -> HolderAssignment {
        use ProposalState as S;

        let faculty = || Some(proposal.faculty_id.clone());
        let owner = || Some(proposal.owner_id.clone());
        let office = || Some(self.central_office_unit.clone());

        let assignment = match target {
            S::Draft | S::Completed => HolderAssignment::unassigned(),
            S::FacultyReview | S::FacultyAcceptanceReview => HolderAssignment::new(faculty(), None),
            S::SchoolSelectionReview | S::SchoolAcceptanceReview | S::Paused => {
                HolderAssignment::new(office(), None)
            }
            // Council assignment is set upstream by the assigning action.
            S::OutlineCouncilReview => HolderAssignment::new(
                proposal.holder_unit.clone(),
                proposal.holder_user.clone(),
            ),
            S::ChangesRequested | S::Approved | S::InProgress | S::Handover => {
                HolderAssignment::new(faculty(), owner())
            }
            S::Cancelled | S::Rejected | S::Withdrawn => HolderAssignment::new(
                actor_unit.map(str::to_string).or_else(faculty),
                actor_id.map(str::to_string),
            ),
        };

        debug!(
            proposal_id = %proposal.id,
            target = %target,
            holder_unit = ?assignment.holder_unit,
            holder_user = ?assignment.holder_user,
            "Resolved holder"
        );
        assignment
    }

    /// Whether a user may act given the proposal's current holder.
    pub fn can_user_act(
        &self,
        proposal: &Proposal,
        user_id: &str,
        user_faculty_id: Option<&str>,
        role: Role,
    ) -> bool {
        if registry::is_terminal(proposal.state) {
            return false;
        }
        if proposal.state == ProposalState::Draft {
            return proposal.owner_id == user_id;
        }
        if let Some(holder_user) = &proposal.holder_user {
            return holder_user == user_id;
        }
        match &proposal.holder_unit {
            Some(unit) if *unit == self.central_office_unit => role == Role::PhongKhcn,
            Some(unit) => user_faculty_id == Some(unit.as_str()),
            None => true,
        }
    }

    /// Short label for showing the current holder.
    pub fn display_label(&self, holder_unit: Option<&str>, holder_user: Option<&str>) -> String {
        match (holder_unit, holder_user) {
            (_, Some(user)) => format!("User {user}"),
            (Some(unit), None) if unit == self.central_office_unit => "Central science office".to_string(),
            (Some(unit), None) => format!("Faculty ({unit})"),
            (None, None) => "Unassigned".to_string(),
        }
    }
}
