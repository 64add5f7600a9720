use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Output;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AgentError, BuildAgent, BuildArtifact, BuildContext, TestAgent, TestContext, TestReport};
use crate::contract::{Contract, DependencyHandle, OperationSignature};
use crate::model::Unit;

/// Metadata key holding a unit's build command
pub const BUILD_KEY: &str = "build";
/// Metadata key holding a unit's test command
pub const TEST_KEY: &str = "test";

/// Optional JSON line a build command may print last
#[derive(Debug, Deserialize)]
struct BuildSummary {
    artifact_ref: Option<String>,
    #[serde(default)]
    contract: Option<Vec<OperationSignature>>,
}

/// Optional JSON line a test command may print last
#[derive(Debug, Deserialize)]
struct TestSummary {
    passed: u32,
    failed: u32,
    #[serde(default)]
    failing_ids: Vec<String>,
}

/// Runs per-unit shell commands taken from the unit's metadata.
///
/// Dependencies are exported as `WAVEFRONT_DEPS` (`id=real` / `id=stub`,
/// comma separated). A unit without a command builds to a placeholder
/// artifact and passes with zero tests.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    shell: String,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl Default for CommandAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandAgent {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn command_for(unit: &Unit, key: &str) -> Option<String> {
        match unit.metadata.get(key) {
            Some(Value::String(cmd)) if !cmd.trim().is_empty() => Some(cmd.clone()),
            _ => None,
        }
    }

    async fn dependency_env(dependencies: &[DependencyHandle]) -> String {
        let mut parts = Vec::with_capacity(dependencies.len());
        for handle in dependencies {
            let kind = if handle.is_stub().await { "stub" } else { "real" };
            parts.push(format!("{}={}", handle.provider(), kind));
        }
        parts.join(",")
    }

    async fn run(
        &self,
        script: &str,
        vars: Vec<(&'static str, String)>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Output, AgentError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(script).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.env);
        for (key, value) in vars {
            cmd.env(key, value);
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            output = cmd.output() => output
                .map_err(|e| AgentError::System(format!("failed to spawn '{}': {}", self.shell, e))),
        }
    }
}

/// Last non-empty stdout line, if it parses as `T`
fn trailing_json<T: for<'de> Deserialize<'de>>(stdout: &[u8]) -> Option<T> {
    let text = String::from_utf8_lossy(stdout);
    let line = text.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str(line.trim()).ok()
}

fn stderr_tail(output: &Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(20);
    lines[start..].join("\n")
}

#[async_trait]
impl BuildAgent for CommandAgent {
    async fn build(&self, ctx: &BuildContext) -> Result<BuildArtifact, AgentError> {
        let fallback_ref = format!("{}@{}", ctx.unit.id, ctx.attempt);
        let Some(script) = Self::command_for(&ctx.unit, BUILD_KEY) else {
            debug!(unit = %ctx.unit.id, "No build command, using placeholder artifact");
            return Ok(BuildArtifact::new(fallback_ref));
        };

        let vars = vec![
            ("WAVEFRONT_RUN_ID", ctx.run_id.clone()),
            ("WAVEFRONT_UNIT", ctx.unit.id.clone()),
            ("WAVEFRONT_ATTEMPT", ctx.attempt.to_string()),
            ("WAVEFRONT_DEPS", Self::dependency_env(&ctx.dependencies).await),
        ];
        let output = self.run(&script, vars, &ctx.cancel).await?;

        if !output.status.success() {
            return Err(AgentError::user(format!(
                "build command exited with {}: {}",
                output.status,
                stderr_tail(&output)
            )));
        }

        let mut artifact = BuildArtifact::new(fallback_ref);
        if let Some(summary) = trailing_json::<BuildSummary>(&output.stdout) {
            if let Some(artifact_ref) = summary.artifact_ref {
                artifact.artifact_ref = artifact_ref;
            }
            if let Some(operations) = summary.contract {
                artifact.contract = Some(Contract::new(ctx.unit.id.clone(), operations));
            }
        }
        Ok(artifact)
    }
}

#[async_trait]
impl TestAgent for CommandAgent {
    async fn test(&self, ctx: &TestContext) -> Result<TestReport, AgentError> {
        let Some(script) = Self::command_for(&ctx.unit, TEST_KEY) else {
            return Ok(TestReport::passing(0));
        };

        let vars = vec![
            ("WAVEFRONT_RUN_ID", ctx.run_id.clone()),
            ("WAVEFRONT_UNIT", ctx.unit.id.clone()),
            ("WAVEFRONT_ATTEMPT", ctx.attempt.to_string()),
            ("WAVEFRONT_SCOPE", ctx.scope.to_string()),
            ("WAVEFRONT_ARTIFACT", ctx.artifact_ref.clone().unwrap_or_default()),
            ("WAVEFRONT_DEPS", Self::dependency_env(&ctx.dependencies).await),
        ];
        let started = Instant::now();
        let output = self.run(&script, vars, &ctx.cancel).await?;
        let duration = started.elapsed();

        let report = match trailing_json::<TestSummary>(&output.stdout) {
            Some(summary) => TestReport {
                passed: summary.passed,
                failed: summary.failed,
                failing_ids: summary.failing_ids,
                duration,
            },
            None if output.status.success() => TestReport::passing(1).with_duration(duration),
            None => {
                warn!(unit = %ctx.unit.id, status = %output.status, "Test command failed");
                TestReport::failing([format!("{}::{}", ctx.unit.id, TEST_KEY)])
                    .with_duration(duration)
            }
        };
        Ok(report)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::agent::TestScope;
    use crate::model::{BuildPlan, UnitDeclaration};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn unit(build: Option<&str>, test: Option<&str>) -> Arc<Unit> {
        let mut decl = UnitDeclaration::new("cart");
        if let Some(cmd) = build {
            decl.metadata.insert(BUILD_KEY.into(), json!(cmd));
        }
        if let Some(cmd) = test {
            decl.metadata.insert(TEST_KEY.into(), json!(cmd));
        }
        let mut units = BuildPlan::new(vec![decl]).into_units().unwrap();
        Arc::new(units.remove(0))
    }

    fn build_ctx(unit: Arc<Unit>) -> BuildContext {
        BuildContext {
            run_id: "r".into(),
            unit,
            attempt: 2,
            dependencies: vec![],
            cancel: CancellationToken::new(),
        }
    }

    fn test_ctx(unit: Arc<Unit>) -> TestContext {
        TestContext {
            run_id: "r".into(),
            unit,
            attempt: 1,
            scope: TestScope::Phase(1),
            artifact_ref: None,
            dependencies: vec![],
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_build_without_command() {
        let artifact = CommandAgent::new().build(&build_ctx(unit(None, None))).await.unwrap();
        assert_eq!(artifact.artifact_ref, "cart@2");
    }

    #[tokio::test]
    async fn test_build_reads_summary_line() {
        let script = r#"echo compiling; echo '{"artifact_ref": "dist/cart-'$WAVEFRONT_ATTEMPT'.tar"}'"#;
        let artifact = CommandAgent::new()
            .build(&build_ctx(unit(Some(script), None)))
            .await
            .unwrap();
        assert_eq!(artifact.artifact_ref, "dist/cart-2.tar");
    }

    #[tokio::test]
    async fn test_build_failure_is_user_error() {
        let err = CommandAgent::new()
            .build(&build_ctx(unit(Some("echo boom >&2; exit 3"), None)))
            .await
            .unwrap_err();
        match err {
            AgentError::User(message) => assert!(message.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_test_summary_and_exit_status() {
        let agent = CommandAgent::new();
        let summary = r#"echo '{"passed": 4, "failed": 1, "failing_ids": ["cart::totals"]}'"#;
        let report = agent.test(&test_ctx(unit(None, Some(summary)))).await.unwrap();
        assert_eq!(report.passed, 4);
        assert_eq!(report.failing_ids, vec!["cart::totals".to_string()]);

        let report = agent.test(&test_ctx(unit(None, Some("exit 1")))).await.unwrap();
        assert!(!report.is_passed());

        let report = agent
            .test(&test_ctx(unit(None, Some("test \"$WAVEFRONT_SCOPE\" = phase-1"))))
            .await
            .unwrap();
        assert!(report.is_passed());
    }

    #[tokio::test]
    async fn test_cancelled_command() {
        let ctx = test_ctx(unit(None, Some("sleep 5")));
        ctx.cancel.cancel();
        let err = CommandAgent::new().test(&ctx).await.unwrap_err();
        assert_eq!(err, AgentError::Cancelled);
    }
}
