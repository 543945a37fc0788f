use anyhow::Result;
use chrono::{DateTime, Utc};
use proposal_flow::audit::MemoryAuditSink;
use proposal_flow::calendar::SystemClock;
use proposal_flow::engine::{NewProposal, WorkflowEngine};
use proposal_flow::store::MemoryStore;
use proposal_flow::workflow::{
    Actor, Idempotent, ProposalState, ResubmitRequest, ReturnDetails, ReturnReasonCode, Role,
    TransitionContext, TransitionOutcome, WorkflowAction,
};
use proposal_flow::ShutdownCoordinator;
use serde::Serialize;
use std::sync::Arc;

use super::{load_config, Command};

const COUNCIL_UNIT: &str = "COUNCIL-OUTLINE-01";

pub struct DemoCommand;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TimelineStep {
    step: usize,
    action: WorkflowAction,
    actor: String,
    from: ProposalState,
    to: ProposalState,
    holder_unit: Option<String>,
    holder_user: Option<String>,
    sla_deadline: Option<DateTime<Utc>>,
    replayed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DemoReport {
    proposal_id: String,
    final_state: ProposalState,
    timeline: Vec<TimelineStep>,
    log_entries: usize,
    audit_events: usize,
}

fn record(timeline: &mut Vec<TimelineStep>, result: Idempotent<TransitionOutcome>) {
    let replayed = result.is_cached;
    let outcome = result.into_inner();
    timeline.push(TimelineStep {
        step: timeline.len() + 1,
        action: outcome.log_entry.action,
        actor: outcome.log_entry.actor_name,
        from: outcome.previous_state,
        to: outcome.current_state,
        holder_unit: outcome.holder_unit,
        holder_user: outcome.holder_user,
        sla_deadline: outcome.proposal.sla_deadline,
        replayed,
    });
}

impl Command for DemoCommand {
    async fn execute(&self) -> Result<()> {
        let config = load_config()?;
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = WorkflowEngine::with_parts(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            audit.clone(),
        );

        let proposal = engine
            .create_proposal(NewProposal {
                code: "DT-DEMO-001".to_string(),
                title: "Low-cost water quality sensing for aquaculture".to_string(),
                owner_id: "lecturer-01".to_string(),
                faculty_id: "FAC-BIO".to_string(),
            })
            .await?;
        let id = proposal.id.as_str();
        let actions = engine.actions();

        let lecturer = TransitionContext::new(
            Actor::new("lecturer-01", Role::GiangVien)
                .with_faculty("FAC-BIO")
                .with_display_name("Lecturer"),
        );
        let manager = TransitionContext::new(
            Actor::new("manager-01", Role::QuanLyKhoa)
                .with_faculty("FAC-BIO")
                .with_display_name("Faculty manager"),
        );
        let office = TransitionContext::new(
            Actor::new("office-01", Role::PhongKhcn).with_display_name("Science office"),
        );
        let secretary = TransitionContext::new(
            Actor::new("secretary-01", Role::ThuKyHoiDong).with_display_name("Council secretary"),
        );

        let mut timeline = Vec::new();
        record(&mut timeline, actions.submit(id, &lecturer).await?);
        record(&mut timeline, actions.approve_faculty(id, &manager).await?);
        record(
            &mut timeline,
            actions
                .assign_council(id, &office, COUNCIL_UNIT, Some("secretary-01"))
                .await?,
        );
        record(
            &mut timeline,
            actions
                .return_council(
                    id,
                    &secretary,
                    ReturnDetails::new("The methodology section needs a sampling plan")
                        .with_code(ReturnReasonCode::UnclearContent)
                        .with_sections(["SEC_METHOD"]),
                )
                .await?,
        );
        record(
            &mut timeline,
            actions
                .resubmit(
                    id,
                    &lecturer,
                    ResubmitRequest {
                        revised_sections: vec!["SEC_METHOD".to_string()],
                        comment: Some("Added a sampling plan".to_string()),
                    },
                )
                .await?,
        );
        record(&mut timeline, actions.approve_council(id, &secretary).await?);

        let final_state = engine.find_proposal(id).await?.state;
        let log_entries = engine.history(id).await?.len();
        ShutdownCoordinator::new(&engine).shutdown_all_services().await;

        let report = DemoReport {
            proposal_id: id.to_string(),
            final_state,
            timeline,
            log_entries,
            audit_events: audit.events().len(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
