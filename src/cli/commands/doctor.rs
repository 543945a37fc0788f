use anyhow::Result;
use proposal_flow::config::{config, WorkflowConfig};
use proposal_flow::engine::WorkflowEngine;
use serde::Serialize;
use std::collections::BTreeMap;

use super::Command;
use crate::cli::OutputFormat;

/// Doctor command for configuration and storage health checks
pub struct DoctorCommand {
    pub format: OutputFormat,
}

/// Result of a diagnostic check
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticResult {
    pub status: DiagnosticStatus,
    pub message: String,
    pub suggestion: Option<String>,
}

/// Status of a diagnostic check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticStatus {
    Pass,
    Fail,
    Warning,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticReport {
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub checks: BTreeMap<&'static str, DiagnosticResult>,
}

impl DiagnosticResult {
    fn pass(message: impl Into<String>) -> Self {
        Self {
            status: DiagnosticStatus::Pass,
            message: message.into(),
            suggestion: None,
        }
    }

    fn fail(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            status: DiagnosticStatus::Fail,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    fn warning(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            status: DiagnosticStatus::Warning,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

impl DoctorCommand {
    async fn run_diagnostics(&self) -> DiagnosticReport {
        let mut checks = BTreeMap::new();

        let loaded = match config() {
            Ok(config) => {
                checks.insert(
                    "configuration",
                    DiagnosticResult::pass(format!(
                        "Loaded; central office unit {}",
                        config.central_office_unit
                    )),
                );
                config.clone()
            }
            Err(e) => {
                checks.insert(
                    "configuration",
                    DiagnosticResult::fail(
                        e.to_string(),
                        "Check proposal-flow.toml and PROPOSAL_FLOW__* environment variables",
                    ),
                );
                WorkflowConfig::default()
            }
        };

        checks.insert("database", database_check(&loaded));

        match WorkflowEngine::connect(loaded).await {
            Ok(engine) => {
                let health = engine.health_check().await;
                let store = match health.store_error {
                    None => DiagnosticResult::pass("Store reachable"),
                    Some(e) => DiagnosticResult::fail(e, "Verify the database URL and permissions"),
                };
                checks.insert("store", store);
                checks.insert(
                    "audit",
                    DiagnosticResult::pass(format!(
                        "{} audit records pending",
                        health.pending_audit_records
                    )),
                );
            }
            Err(e) => {
                checks.insert(
                    "store",
                    DiagnosticResult::fail(e.to_string(), "Verify the database URL and permissions"),
                );
            }
        }

        let count = |status: DiagnosticStatus| checks.values().filter(|c| c.status == status).count();
        DiagnosticReport {
            passed: count(DiagnosticStatus::Pass),
            failed: count(DiagnosticStatus::Fail),
            warnings: count(DiagnosticStatus::Warning),
            checks,
        }
    }

    fn output_report(&self, report: &DiagnosticReport) -> Result<()> {
        if self.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(report)?);
            return Ok(());
        }

        println!("🩺 PROPOSAL-FLOW DIAGNOSTICS");
        println!();
        for (name, check) in &report.checks {
            let icon = match check.status {
                DiagnosticStatus::Pass => "✅",
                DiagnosticStatus::Fail => "❌",
                DiagnosticStatus::Warning => "⚠️ ",
            };
            println!("{icon} {name}: {}", check.message);
            if let Some(suggestion) = &check.suggestion {
                println!("   💡 {suggestion}");
            }
        }
        println!();
        println!(
            "📊 {} passed, {} failed, {} warnings",
            report.passed, report.failed, report.warnings
        );
        Ok(())
    }
}

fn database_check(config: &WorkflowConfig) -> DiagnosticResult {
    match (&config.database, cfg!(feature = "database")) {
        (None, _) => DiagnosticResult::pass("No database configured; using the in-process store"),
        (Some(db), true) => DiagnosticResult::pass(format!("Database configured at {}", db.url)),
        (Some(_), false) => DiagnosticResult::warning(
            "Database configured but the binary was built without the database feature",
            "Rebuild with --features database",
        ),
    }
}

impl Command for DoctorCommand {
    async fn execute(&self) -> Result<()> {
        let report = self.run_diagnostics().await;
        self.output_report(&report)?;

        if report.failed > 0 {
            anyhow::bail!("{} diagnostic checks failed", report.failed);
        }
        Ok(())
    }
}
