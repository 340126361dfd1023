//! Orchestrator admission, backpressure, and cancellation.

mod common;

use common::{ScriptedLlm, StaticHost};
use medic::context::Services;
use medic::error::EngineError;
use medic::orchestrator::{Orchestrator, RepairRequest};
use medic::state::GraphState;
use medic_config::{ExecutionBackend, RepairConfig};
use medic_store::Store;
use std::sync::Arc;
use std::time::Duration;

fn config(max_concurrent: usize, queue_depth: usize) -> RepairConfig {
    RepairConfig {
        execution_backend: ExecutionBackend::Simulation,
        max_concurrent_agents: max_concurrent,
        admission_queue_depth: queue_depth,
        repo: String::new(),
        ..Default::default()
    }
}

async fn orchestrator_with(
    llm: ScriptedLlm,
    logs: &str,
    config: RepairConfig,
) -> (Orchestrator, Store) {
    let store = Store::connect_in_memory().await.unwrap();
    let services = Services {
        llm: llm.into_client(),
        host: Arc::new(StaticHost::new(logs)),
        store: store.clone(),
    };
    (Orchestrator::with_services(config, services), store)
}

fn command_diagnosis(suggested: &str, reproduction: &str) -> String {
    format!(
        r#"{{"summary": "scripted failure", "file_path": null, "fix_action": "command",
            "suggested_command": "{suggested}", "reproduction_command": "{reproduction}",
            "confidence": 0.9}}"#
    )
}

#[tokio::test]
async fn session_runs_to_success_through_admission() {
    let llm = ScriptedLlm::new().on(
        "CI-failure diagnostician",
        command_diagnosis("echo fixing", "true"),
    );
    let (orchestrator, store) =
        orchestrator_with(llm, "Error: Cannot find module 'x'", config(1, 8)).await;

    let run_id = orchestrator
        .submit(RepairRequest {
            group_id: "wf-1".to_string(),
            workflow_run_id: 101,
        })
        .await
        .unwrap();

    orchestrator.wait_for(&run_id).await.unwrap();
    let run = store.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, "success");
    assert_eq!(orchestrator.active_sessions().await, 0);
}

#[tokio::test]
async fn saturated_queue_overloads_fast() {
    // Slow session: the fix command sleeps, holding the only slot.
    let llm = ScriptedLlm::new().on(
        "CI-failure diagnostician",
        command_diagnosis("sleep 2", "true"),
    );
    let (orchestrator, _) =
        orchestrator_with(llm, "Error: Cannot find module 'x'", config(1, 1)).await;

    let first = orchestrator
        .submit(RepairRequest {
            group_id: "wf-1".to_string(),
            workflow_run_id: 1,
        })
        .await
        .unwrap();

    let second = orchestrator
        .submit(RepairRequest {
            group_id: "wf-2".to_string(),
            workflow_run_id: 2,
        })
        .await;
    assert!(matches!(second, Err(EngineError::Overloaded)));

    orchestrator.wait_for(&first).await.unwrap();

    // Capacity freed: the next admission goes through.
    let third = orchestrator
        .submit(RepairRequest {
            group_id: "wf-3".to_string(),
            workflow_run_id: 3,
        })
        .await;
    assert!(third.is_ok());
    orchestrator.wait_for(&third.unwrap()).await.unwrap();
}

#[tokio::test]
async fn cancellation_kills_running_session() {
    let llm = ScriptedLlm::new().on(
        "CI-failure diagnostician",
        command_diagnosis("sleep 30", "true"),
    );
    let (orchestrator, store) =
        orchestrator_with(llm, "Error: Cannot find module 'x'", config(1, 8)).await;

    let run_id = orchestrator
        .submit(RepairRequest {
            group_id: "wf-1".to_string(),
            workflow_run_id: 7,
        })
        .await
        .unwrap();

    // Let the session get into its long-running command, then cancel.
    tokio::time::sleep(Duration::from_millis(400)).await;
    orchestrator.cancel(&run_id).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_for(&run_id))
        .await
        .expect("cancelled session drains promptly")
        .unwrap();

    let run = store.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, "failed");
    let state: GraphState = serde_json::from_str(&run.state).unwrap();
    assert!(state
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("Cancelled"));
}

#[tokio::test]
async fn shutdown_drains_sessions() {
    let llm = ScriptedLlm::new().on(
        "CI-failure diagnostician",
        command_diagnosis("sleep 5", "true"),
    );
    let (orchestrator, store) =
        orchestrator_with(llm, "Error: Cannot find module 'x'", config(2, 8)).await;

    let a = orchestrator
        .submit(RepairRequest {
            group_id: "wf-a".to_string(),
            workflow_run_id: 1,
        })
        .await
        .unwrap();
    let b = orchestrator
        .submit(RepairRequest {
            group_id: "wf-b".to_string(),
            workflow_run_id: 2,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    tokio::time::timeout(Duration::from_secs(15), orchestrator.shutdown())
        .await
        .expect("shutdown completes");

    for run_id in [a, b] {
        let run = store.get_run(&run_id).await.unwrap();
        assert!(run.is_terminal(), "run {run_id} still {}", run.status);
    }

    // New work is refused after shutdown.
    let refused = orchestrator
        .submit(RepairRequest {
            group_id: "wf-c".to_string(),
            workflow_run_id: 3,
        })
        .await;
    assert!(matches!(refused, Err(EngineError::Cancelled)));
}
