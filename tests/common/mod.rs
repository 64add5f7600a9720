//! Scripted in-memory build/test agent shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wavefront::agent::{
    AgentError, BuildAgent, BuildArtifact, BuildContext, TestAgent, TestContext, TestReport,
    TestScope,
};
use wavefront::contract::{Contract, InvocationError, Provider};

/// Real implementation handed out by scripted builds
pub struct RealProvider {
    pub unit: String,
}

#[async_trait]
impl Provider for RealProvider {
    async fn invoke(&self, operation: &str, input: &Value) -> Result<Value, InvocationError> {
        Ok(json!({ "real": self.unit, "operation": operation, "input": input }))
    }
}

/// A dependency call made from inside a build or test
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub consumer: String,
    pub provider: String,
    pub scope: String,
    pub via_stub: bool,
    pub response: Option<Value>,
}

#[derive(Default)]
pub struct Script {
    pub build_delay: HashMap<String, Duration>,
    /// Fail this many build attempts (u32::MAX = always)
    pub build_failures: HashMap<String, u32>,
    pub test_failures: HashMap<String, u32>,
    pub test_delay: HashMap<String, Duration>,
    pub integration_failures: HashSet<String>,
    /// Contract a unit's build reports
    pub reported_contracts: HashMap<String, Contract>,
    /// Operation each consumer calls on its dependencies while building
    pub calls: HashMap<String, String>,
}

#[derive(Default)]
pub struct ScriptedAgent {
    pub script: Script,
    pub builds: Mutex<Vec<(String, u32)>>,
    pub tests: Mutex<Vec<(String, String)>>,
    pub observations: Mutex<Vec<Observation>>,
    running: AtomicUsize,
    pub peak_concurrency: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Default::default()
        })
    }

    pub fn build_attempts(&self, unit: &str) -> usize {
        self.builds.lock().iter().filter(|(u, _)| u == unit).count()
    }

    pub fn tested(&self, unit: &str, scope: &str) -> bool {
        self.tests
            .lock()
            .iter()
            .any(|(u, s)| u == unit && s == scope)
    }

    pub fn observations_of(&self, consumer: &str) -> Vec<Observation> {
        self.observations
            .lock()
            .iter()
            .filter(|o| o.consumer == consumer)
            .cloned()
            .collect()
    }

    fn should_fail(table: &HashMap<String, u32>, unit: &str, attempt: u32) -> bool {
        table.get(unit).is_some_and(|n| attempt <= *n)
    }

    async fn observe(
        &self,
        consumer: &str,
        scope: String,
        handles: &[wavefront::contract::DependencyHandle],
    ) {
        for handle in handles {
            let via_stub = handle.is_stub().await;
            let response = match self.script.calls.get(consumer) {
                Some(op) => handle.invoke(op, &json!({ "sample": 1 })).await.ok(),
                None => None,
            };
            self.observations.lock().push(Observation {
                consumer: consumer.to_string(),
                provider: handle.provider().to_string(),
                scope: scope.clone(),
                via_stub,
                response,
            });
        }
    }
}

#[async_trait]
impl BuildAgent for ScriptedAgent {
    async fn build(&self, ctx: &BuildContext) -> Result<BuildArtifact, AgentError> {
        let unit = ctx.unit.id.clone();
        self.builds.lock().push((unit.clone(), ctx.attempt));

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrency.fetch_max(now, Ordering::SeqCst);

        let delay = self.script.build_delay.get(&unit).copied().unwrap_or_default();
        let slept = tokio::select! {
            _ = ctx.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        if !slept {
            return Err(AgentError::Cancelled);
        }

        self.observe(&unit, "build".into(), &ctx.dependencies).await;

        if Self::should_fail(&self.script.build_failures, &unit, ctx.attempt) {
            return Err(AgentError::user(format!("{} does not compile", unit)));
        }

        let mut artifact = BuildArtifact::new(format!("{}@{}", unit, ctx.attempt))
            .with_implementation(Arc::new(RealProvider { unit: unit.clone() }));
        if let Some(contract) = self.script.reported_contracts.get(&unit) {
            artifact = artifact.with_contract(contract.clone());
        }
        Ok(artifact)
    }
}

#[async_trait]
impl TestAgent for ScriptedAgent {
    async fn test(&self, ctx: &TestContext) -> Result<TestReport, AgentError> {
        let unit = ctx.unit.id.clone();
        self.tests.lock().push((unit.clone(), ctx.scope.to_string()));

        let failing = match ctx.scope {
            TestScope::Phase(_) => {
                if let Some(delay) = self.script.test_delay.get(&unit) {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(*delay) => {}
                    }
                }
                Self::should_fail(&self.script.test_failures, &unit, ctx.attempt)
            }
            TestScope::Integration => {
                self.observe(&unit, ctx.scope.to_string(), &ctx.dependencies)
                    .await;
                self.script.integration_failures.contains(&unit)
            }
        };

        if failing {
            Ok(TestReport::failing([format!("{}::suite", unit)]))
        } else {
            Ok(TestReport::passing(3))
        }
    }
}
