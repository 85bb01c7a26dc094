//! # Step Runner
//!
//! Runs terraform steps in a rendered workspace.
//!
//! Steps run to completion with no wall-clock limit: a hung `terraform` process holds its worker
//! until it exits.

use crate::crd::StackPhase;
use crate::observability::metrics;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// One terraform invocation. [`Step::PIPELINE`] is the apply order; `Destroy` only runs
/// on the destroy path, after `Init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Init,
    Plan,
    Apply,
    Destroy,
}

impl Step {
    pub const PIPELINE: [Step; 3] = [Step::Init, Step::Plan, Step::Apply];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Init => "init",
            Step::Plan => "plan",
            Step::Apply => "apply",
            Step::Destroy => "destroy",
        }
    }

    /// Command line after the binary. Every step is non-interactive; the mutating ones
    /// auto-approve.
    pub fn args(self) -> &'static [&'static str] {
        match self {
            Step::Init => &["init", "-input=false"],
            Step::Plan => &["plan", "-input=false", "-no-color"],
            Step::Apply => &["apply", "-auto-approve", "-input=false", "-no-color"],
            Step::Destroy => &["destroy", "-auto-approve", "-input=false", "-no-color"],
        }
    }

    /// Phase the Stack is in while this step runs
    pub fn phase(self) -> StackPhase {
        match self {
            Step::Init => StackPhase::Init,
            Step::Plan => StackPhase::Plan,
            Step::Apply => StackPhase::Apply,
            Step::Destroy => StackPhase::Destroying,
        }
    }

    /// Failure reason recorded when this step fails
    pub fn failure_reason(self) -> &'static str {
        match self {
            Step::Init => "TerraformInitError",
            Step::Plan => "TerraformPlanError",
            Step::Apply => "TerraformApplyError",
            Step::Destroy => "TerraformDestroyError",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step that did not finish successfully. `output` is the combined stdout and stderr.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("terraform {step} failed with exit code {code}: {output}")]
    Exit { step: Step, code: i32, output: String },
    #[error("terraform {step} was terminated by a signal: {output}")]
    Terminated { step: Step, output: String },
    #[error("failed to run terraform {step}: {source}")]
    Spawn {
        step: Step,
        #[source]
        source: std::io::Error,
    },
}

impl StepError {
    pub fn step(&self) -> Step {
        match self {
            StepError::Exit { step, .. }
            | StepError::Terminated { step, .. }
            | StepError::Spawn { step, .. } => *step,
        }
    }
}

/// Seam between the Stack reconciler and terraform.
///
/// [`TerraformRunner`] spawns the real binary; tests substitute a recorder.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run `step` in `workspace` with `env` added to the process environment; returns the
    /// combined stdout and stderr.
    async fn run_step(
        &self,
        workspace: &Path,
        step: Step,
        env: &BTreeMap<String, String>,
    ) -> Result<String, StepError>;

    /// Raw state document after a successful apply
    async fn read_state(
        &self,
        workspace: &Path,
        env: &BTreeMap<String, String>,
    ) -> std::io::Result<Vec<u8>>;
}

/// Runs the `terraform` binary found at `bin` (a path, or a name looked up on `PATH`)
#[derive(Debug, Clone)]
pub struct TerraformRunner {
    bin: String,
}

impl TerraformRunner {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self, workspace: &Path, env: &BTreeMap<String, String>) -> Command {
        let mut command = Command::new(&self.bin);
        command
            .current_dir(workspace)
            .envs(env)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl StepRunner for TerraformRunner {
    async fn run_step(
        &self,
        workspace: &Path,
        step: Step,
        env: &BTreeMap<String, String>,
    ) -> Result<String, StepError> {
        info!(step = step.as_str(), workspace = %workspace.display(), "running terraform step");
        metrics::increment_step_runs(step.as_str());
        let start = Instant::now();

        let result = self
            .command(workspace, env)
            .args(step.args())
            .output()
            .await;
        metrics::observe_step_duration(step.as_str(), start.elapsed().as_secs_f64());

        let output = match result {
            Ok(output) => output,
            Err(source) => {
                metrics::increment_step_failures(step.as_str());
                return Err(StepError::Spawn { step, source });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            debug!(step = step.as_str(), bytes = combined.len(), "terraform step succeeded");
            return Ok(combined);
        }

        metrics::increment_step_failures(step.as_str());
        Err(match output.status.code() {
            Some(code) => StepError::Exit {
                step,
                code,
                output: combined,
            },
            None => StepError::Terminated {
                step,
                output: combined,
            },
        })
    }

    /// `terraform state pull` works for every backend; a local state file is the fallback
    async fn read_state(
        &self,
        workspace: &Path,
        env: &BTreeMap<String, String>,
    ) -> std::io::Result<Vec<u8>> {
        let pulled = self
            .command(workspace, env)
            .args(["state", "pull"])
            .output()
            .await;
        match pulled {
            Ok(output) if output.status.success() && !output.stdout.trim_ascii().is_empty() => {
                Ok(output.stdout)
            }
            Ok(output) => {
                debug!(
                    code = ?output.status.code(),
                    "state pull returned nothing, reading local state file"
                );
                tokio::fs::read(workspace.join("terraform.tfstate")).await
            }
            Err(e) => {
                debug!(error = %e, "state pull could not run, reading local state file");
                tokio::fs::read(workspace.join("terraform.tfstate")).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_arguments() {
        assert_eq!(Step::Init.args(), ["init", "-input=false"]);
        assert_eq!(Step::Plan.args(), ["plan", "-input=false", "-no-color"]);
        assert_eq!(Step::Apply.args()[..2], ["apply", "-auto-approve"]);
        assert_eq!(Step::Destroy.args()[0], "destroy");
    }

    #[test]
    fn test_pipeline_order_and_phases() {
        let phases: Vec<StackPhase> = Step::PIPELINE.iter().map(|s| s.phase()).collect();
        assert_eq!(phases, [StackPhase::Init, StackPhase::Plan, StackPhase::Apply]);
        assert_eq!(Step::Destroy.phase(), StackPhase::Destroying);
    }

    #[test]
    fn test_exit_error_message() {
        let err = StepError::Exit {
            step: Step::Plan,
            code: 1,
            output: "Error: no provider".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "terraform plan failed with exit code 1: Error: no provider"
        );
        assert_eq!(err.step().failure_reason(), "TerraformPlanError");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runner_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-terraform");
        std::fs::write(&script, "#!/bin/sh\necho \"ran $1 in $PWD\"\necho oops >&2\n[ \"$1\" = plan ] && exit 3\nexit 0\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let runner = TerraformRunner::new(script.to_string_lossy());
        let env = BTreeMap::new();
        let output = runner.run_step(dir.path(), Step::Init, &env).await.unwrap();
        assert!(output.starts_with("ran init"));
        assert!(output.ends_with("oops\n"));

        match runner.run_step(dir.path(), Step::Plan, &env).await {
            Err(StepError::Exit { code, output, .. }) => {
                assert_eq!(code, 3);
                assert!(output.contains("ran plan"));
            }
            other => panic!("expected exit error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_state_falls_back_to_local_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("terraform.tfstate"), b"{\"outputs\":{}}").unwrap();
        let runner = TerraformRunner::new("/nonexistent/terraform");
        let state = runner.read_state(dir.path(), &BTreeMap::new()).await.unwrap();
        assert_eq!(state, b"{\"outputs\":{}}");
    }
}
