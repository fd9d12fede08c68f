use colored::Colorize;
use sandkeep_core::{RunStatus, SandboxRun};

/// Print a label/value pair with a bold label, used for the field-by-field
/// `status` rendering.
fn field(label: &str, value: impl std::fmt::Display) {
    println!("{} {}", format!("{:<14}", label).bold(), value);
}

fn colored_status(status: RunStatus) -> String {
    let s = status.to_string();
    match status {
        RunStatus::Succeeded => s.green().to_string(),
        RunStatus::Failed | RunStatus::Canceled => s.red().to_string(),
        RunStatus::Pending | RunStatus::Scheduled | RunStatus::Preparing => s.yellow().to_string(),
        RunStatus::Running | RunStatus::Pausing | RunStatus::Sleeping | RunStatus::Terminating => {
            s.cyan().to_string()
        }
    }
}

/// Render a run as a table of labeled fields.
pub fn run_table(run: &SandboxRun) {
    field("ID", &run.id);
    field("TEMPLATE", run.template_id.as_str());
    field("STATUS", colored_status(run.status));
    field("NODE", run.node_id.as_ref().map(|n| n.as_str().to_string()).unwrap_or_else(|| "-".into()));
    field("STARTED", run.started_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()));
    field("ENDED", run.ended_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()));
    if let Some(code) = run.exit_code {
        field("EXIT CODE", code);
    }
    if let Some(msg) = &run.error_message {
        field("ERROR", msg.red());
    }
}

/// Render a run as JSON.
pub fn run_json(run: &SandboxRun) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(run)?);
    Ok(())
}
