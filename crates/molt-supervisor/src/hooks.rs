//! Operator hooks around a handoff.
//!
//! Pre-flight hooks run in order before every handoff; each must exit 0
//! within its timeout or the handoff is aborted while the current
//! generation keeps serving.
//!
//! Post-process hooks run once the handoff has settled: `on_success` after
//! the previous generation has exited, `on_failure` after a failed or
//! cancelled handoff was rolled back. They see the result in their
//! environment:
//!
//! - `MOLT_HANDOFF_OUTCOME`: `succeeded`, `failed` or `cancelled`
//! - `MOLT_FROM_GENERATION`: the generation that was active when it started
//! - `MOLT_TO_GENERATION`: the promoted generation (success only)
//! - `MOLT_HANDOFF_ERROR`: why it did not succeed (failure only)

use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{HookConfig, PostProcessConfig};
use crate::error::SupervisorError;
use crate::generation::GenerationId;
use crate::supervisor::HandoffOutcome;

/// What post-process hooks are told about a settled handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffReport {
    pub outcome: HandoffOutcome,
    pub from: GenerationId,
    pub to: Option<GenerationId>,
    pub error: Option<String>,
}

impl HandoffReport {
    fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("MOLT_HANDOFF_OUTCOME", self.outcome.as_str().to_string()),
            ("MOLT_FROM_GENERATION", self.from.to_string()),
        ];
        if let Some(to) = self.to {
            env.push(("MOLT_TO_GENERATION", to.to_string()));
        }
        if let Some(error) = &self.error {
            env.push(("MOLT_HANDOFF_ERROR", error.clone()));
        }
        env
    }
}

pub async fn run_preflight(hooks: &[HookConfig]) -> Result<(), SupervisorError> {
    for hook in hooks {
        info!(hook = %hook.name, "Running pre-flight hook");
        if let Err(reason) = execute(hook, &[]).await {
            warn!(hook = %hook.name, %reason, "Pre-flight hook failed");
            return Err(SupervisorError::PreflightFailed {
                name: hook.name.clone(),
                reason,
            });
        }
        info!(hook = %hook.name, "Pre-flight hook passed");
    }
    Ok(())
}

/// Run the hooks matching `report.outcome`. Every hook runs even if an
/// earlier one failed; returns how many failed.
pub async fn run_post_process(config: &PostProcessConfig, report: &HandoffReport) -> usize {
    let hooks = match report.outcome {
        HandoffOutcome::Succeeded => &config.on_success,
        HandoffOutcome::Failed | HandoffOutcome::Cancelled => &config.on_failure,
    };
    let env = report.env();

    let mut failures = 0;
    for hook in hooks {
        info!(hook = %hook.name, outcome = report.outcome.as_str(), "Running post-process hook");
        if let Err(reason) = execute(hook, &env).await {
            warn!(hook = %hook.name, %reason, "Post-process hook failed");
            failures += 1;
        }
    }
    failures
}

async fn execute(hook: &HookConfig, env: &[(&str, String)]) -> Result<(), String> {
    let Some((program, args)) = hook.command.split_first() else {
        return Err("empty command".into());
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env.iter().map(|(key, value)| (*key, value.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let status = match tokio::time::timeout(hook.timeout(), cmd.status()).await {
        Err(_) => return Err(format!("timed out after {}ms", hook.timeout_ms)),
        Ok(Err(err)) => return Err(format!("could not start: {err}")),
        Ok(Ok(status)) => status,
    };

    if !status.success() {
        return Err(format!("exited with {status}"));
    }
    Ok(())
}
