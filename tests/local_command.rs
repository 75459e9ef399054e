//! Local Command Integration Tests
//!
//! Runs graphs through the real `local_command` executor using `sh -c`.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use stepkernel::adapters::LocalCommandExecutor;
use stepkernel::core::{ArtifactIndex, ArtifactQuery, ArtifactStore, GraphRunner, RunLimits};
use stepkernel::domain::{GateSpec, GraphSpec, RunStatus, StepSpec, StepStatus};

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn runner(temp: &TempDir) -> (GraphRunner, ArtifactIndex) {
    let index = ArtifactIndex::open(temp.path().join("index.sqlite3")).unwrap();
    let runner = GraphRunner::new(Arc::new(LocalCommandExecutor::new()), index.clone());
    (runner, index)
}

#[tokio::test]
async fn test_shell_steps_and_gates_in_workspace() {
    let temp = TempDir::new().unwrap();
    let workspace = temp.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();

    let mut gate = GateSpec::new("output_exists", sh("test -f out.txt"));
    gate.workspace_required = true;

    let graph = GraphSpec {
        graph_id: "shell".to_string(),
        steps: vec![
            StepSpec::new("write", sh("echo hello > out.txt && echo wrote")).with_gate(gate),
            StepSpec::new("read", sh("cat out.txt")).depends_on("write"),
        ],
        routing_rules: Vec::new(),
    };

    let (runner, index) = runner(&temp);
    let run_root = temp.path().join("run");
    let state = runner
        .with_workspace(&workspace)
        .run_graph_with_id("shell-run", &run_root, &graph)
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Succeeded);
    assert!(workspace.join("out.txt").exists());

    let store = ArtifactStore::open(&run_root, "shell-run", index.clone()).unwrap();
    let attempts = index
        .list(&ArtifactQuery::for_run("shell-run").with_producer("read"))
        .unwrap();
    assert_eq!(attempts.len(), 1);
    let attempt = store.get_json(&attempts[0]).await.unwrap();
    assert_eq!(attempt["stdout"].as_str().unwrap().trim(), "hello");
    assert!(store.verify(&attempts[0]).await.unwrap());
}

#[tokio::test]
async fn test_shell_failure_and_timeout() {
    let temp = TempDir::new().unwrap();
    let mut slow = StepSpec::new("slow", sh("sleep 5"));
    slow.timeout_policy.timeout_seconds = Some(1);

    let graph = GraphSpec {
        graph_id: "shell".to_string(),
        steps: vec![slow],
        routing_rules: Vec::new(),
    };

    let (runner, _index) = runner(&temp);
    let state = runner
        .with_limits(RunLimits {
            run_timeout: Duration::from_secs(60),
            ..Default::default()
        })
        .run_graph(&temp.path().join("run"), &graph)
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Failed);
    let record = state.record("slow").unwrap();
    assert_eq!(record.status, StepStatus::Failed);
    assert!(record.last_error.as_deref().unwrap().starts_with("timeout"));
}

#[tokio::test]
async fn test_nonzero_exit_is_recorded() {
    let temp = TempDir::new().unwrap();
    let graph = GraphSpec {
        graph_id: "shell".to_string(),
        steps: vec![StepSpec::new("fail", sh("echo oops >&2; exit 7"))],
        routing_rules: Vec::new(),
    };

    let (runner, _index) = runner(&temp);
    let state = runner
        .run_graph(&temp.path().join("run"), &graph)
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(
        state.record("fail").unwrap().last_error.as_deref(),
        Some("exit code 7")
    );
}
