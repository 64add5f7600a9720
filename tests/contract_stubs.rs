//! Stub sharing and substitution as seen by consumers of one provider.

mod common;

use common::{Script, ScriptedAgent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use wavefront::contract::{
    Binding, Contract, ContractRegistry, OperationSignature, RealImplementation, Shape,
};
use wavefront::{BuildPlan, Orchestrator, OrchestratorConfig, UnitDeclaration, UnitStatus};

#[tokio::test]
async fn test_consumers_share_one_deterministic_stub() {
    let mut script = Script::default();
    script
        .build_delay
        .insert("E".into(), Duration::from_millis(80));
    script.calls.insert("D1".into(), "e.get".into());
    script.calls.insert("D2".into(), "e.get".into());
    let agent = ScriptedAgent::new(script);

    let config = OrchestratorConfig::builder().max_retries(0).build().unwrap();
    let orchestrator = Orchestrator::new(config, agent.clone(), agent.clone()).unwrap();
    let mut run = orchestrator
        .prepare(BuildPlan::new(vec![
            UnitDeclaration::new("D1").depends_on("E").stub_eligible(true),
            UnitDeclaration::new("D2").depends_on("E").stub_eligible(true),
            UnitDeclaration::new("E").exports("e.get"),
        ]))
        .unwrap();
    assert_eq!(run.plan().len(), 1);
    assert_eq!(run.plan().stubbed_dependencies().count(), 2);

    run.execute().await.unwrap();

    let d1 = agent.observations_of("D1").remove(0);
    let d2 = agent.observations_of("D2").remove(0);
    assert!(d1.via_stub && d2.via_stub);
    assert_eq!(d1.response, d2.response);

    // the stub is still the run's single instance until substitution
    let registry = run.registry().clone();
    assert_eq!(registry.stub_count(), 1);
    let stub = registry.generate_stub("E").unwrap();
    assert_eq!(stub.call_count(), 2);
    assert!(registry.is_promoted("E"));

    let integration = run.integrate().await.unwrap();
    assert_eq!(integration.swapped.len(), 2);
    assert!(integration.passed);
    assert_eq!(registry.stub_count(), 0);
    assert_eq!(run.tracker().unit_status("E"), Some(UnitStatus::Passed));
}

#[tokio::test]
async fn test_in_flight_call_finishes_on_one_implementation() {
    let registry = Arc::new(ContractRegistry::new("run-swap"));
    registry
        .register(Contract::new(
            "E",
            vec![OperationSignature::new("get", Shape::Any, Shape::Any)],
        ))
        .unwrap();

    let handle = registry.bind("D", "E").unwrap();
    registry.promote(RealImplementation {
        unit: "E".into(),
        artifact_ref: "E@1".into(),
        provider: Some(Arc::new(common::RealProvider { unit: "E".into() })),
    });
    // promotion alone does not touch existing bindings
    assert!(handle.is_stub().await);

    // a consumer mid-exchange with the stub
    let session = handle.session().await;
    let first = session.invoke("get", &json!({ "k": 1 })).await.unwrap();

    let swapper = registry.clone();
    let swap = tokio::spawn(async move { swapper.swap_in_real().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!swap.is_finished(), "swap must wait for the in-flight exchange");

    // the rest of the exchange is still served by the same stub
    assert!(session.is_stub());
    let second = session.invoke("get", &json!({ "k": 1 })).await.unwrap();
    assert_eq!(first, second);
    assert!(first.get("real").is_none());
    drop(session);

    let summary = swap.await.unwrap();
    assert_eq!(summary.swapped, vec![("D".to_string(), "E".to_string())]);
    assert!(matches!(handle.binding().await, Binding::Real(_)));

    let after = handle.invoke("get", &json!({ "k": 1 })).await.unwrap();
    assert_eq!(after["real"], json!("E"));
}
