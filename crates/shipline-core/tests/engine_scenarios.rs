//! End-to-end engine scenarios with scripted actions and in-memory sinks.

use std::sync::Arc;
use std::time::Duration;

use shipline_core::fakes::{
    FailingNotifier, RecordingNotifier, ScriptedInvoker, ScriptedStep, StaticPullRequestLookup,
};
use shipline_core::{
    ActionRef, EngineSettings, EventKind, FailureReason, Gate, GateRule, GateSet, GraphError,
    PipelineDefinition, PipelineEngine, ProcessInvoker, PullRequest, PullRequestState, RunStatus,
    StageGraph, StageSpec, StageStatus, TriggerContext,
};
use shipline_state::fakes::MemoryRunHistory;
use shipline_state::{RunHistory, RunOutcome};

fn stage(id: &str, deps: &[&str]) -> StageSpec {
    deps.iter()
        .fold(StageSpec::new(id, ActionRef::command(["true"])), |s, d| {
            s.depends_on(*d)
        })
}

/// `[lint] -> [test] -> [build, deploy]`
fn deploy_graph() -> StageGraph {
    StageGraph::from_specs([
        stage("lint", &[]),
        stage("test", &["lint"]),
        stage("build", &["test"]),
        stage("deploy", &["test"]),
    ])
    .unwrap()
}

fn push_to_main() -> TriggerContext {
    TriggerContext::new(EventKind::Push, "main", "4f2a9c1", "alice")
}

fn open_pr(number: u64, head: &str, base: &str) -> PullRequest {
    PullRequest {
        number,
        head: head.to_string(),
        base: base.to_string(),
        state: PullRequestState::Open,
        title: format!("Release {head}"),
    }
}

fn release_pr_gate() -> Gate {
    Gate::new(
        "no-open-release-pr",
        GateRule::NoOpenPullRequest {
            base: None,
            head_prefix: Some("release/".to_string()),
            ignore_source: true,
        },
    )
}

#[tokio::test]
async fn test_lint_failure_skips_everything_downstream() {
    let invoker = Arc::new(ScriptedInvoker::failing("lint"));
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = PipelineEngine::new("deploy", deploy_graph(), invoker.clone())
        .unwrap()
        .with_notifier(notifier.clone());

    let run = engine.run(push_to_main()).await.unwrap();

    assert_eq!(run.status(), RunStatus::Failed);
    assert_eq!(run.stage("lint").unwrap().status, StageStatus::Failed);
    for id in ["test", "build", "deploy"] {
        assert_eq!(run.stage(id).unwrap().status, StageStatus::Skipped, "{id}");
        assert!(!invoker.was_invoked(id), "{id} must not be invoked");
    }

    let delivered = notifier.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].status, RunStatus::Failed);
    assert!(delivered[0].summary.contains("failed"));
}

#[tokio::test]
async fn test_all_stages_succeed() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = PipelineEngine::new("deploy", deploy_graph(), invoker.clone())
        .unwrap()
        .with_notifier(notifier.clone());

    let run = engine.run(push_to_main()).await.unwrap();

    assert_eq!(run.status(), RunStatus::Succeeded);
    assert_eq!(run.executed_count(), 4);
    assert_eq!(&invoker.invoked()[..2], ["lint", "test"]);

    let delivered = notifier.delivered();
    assert_eq!(delivered.len(), 1);
    for id in ["lint", "test", "build", "deploy"] {
        assert!(delivered[0].summary.contains(&format!("`{id}`")), "{id}");
    }
}

#[tokio::test]
async fn test_open_pr_on_staging_denies_pull_request() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let lookup = StaticPullRequestLookup::empty().with_pull_request(open_pr(
        12,
        "release/1.4",
        "staging",
    ));
    let engine = PipelineEngine::new("deploy", deploy_graph(), invoker.clone())
        .unwrap()
        .with_gates(GateSet::new(vec![release_pr_gate()]))
        .with_lookup(Arc::new(lookup));

    let trigger = TriggerContext::new(EventKind::PullRequest, "staging", "feature/x", "bob")
        .with_pull_request(40);
    let run = engine.run(trigger).await.unwrap();

    assert_eq!(run.status(), RunStatus::Denied);
    assert_ne!(run.status(), RunStatus::Failed);
    assert!(run
        .denial_reason
        .as_deref()
        .unwrap()
        .contains("open pull request #12"));
    assert!(invoker.invoked().is_empty());
}

#[tokio::test]
async fn test_merge_queue_enqueued_with_open_release_pr_is_denied() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let lookup = Arc::new(
        StaticPullRequestLookup::empty().with_pull_request(open_pr(7, "release/2.0", "main")),
    );
    let gates = GateSet::new(vec![
        release_pr_gate().on([EventKind::MergeQueue]),
        Gate::new(
            "queue-action",
            GateRule::ActionIn {
                actions: vec!["enqueued".to_string()],
            },
        )
        .on([EventKind::MergeQueue]),
    ]);
    let engine = PipelineEngine::new("deploy", deploy_graph(), invoker.clone())
        .unwrap()
        .with_gates(gates)
        .with_lookup(lookup.clone())
        .with_notifier(notifier.clone());

    let trigger =
        TriggerContext::new(EventKind::MergeQueue, "main", "gh-readonly-queue/main/pr-9", "bot")
            .with_action("enqueued");
    let run = engine.run(trigger).await.unwrap();

    assert_eq!(run.status(), RunStatus::Denied);
    assert_eq!(run.executed_count(), 0);
    assert_eq!(run.count(StageStatus::Pending), 4);
    assert_eq!(run.gates.len(), 2);
    assert!(run.gates[1].decision.is_allow());
    assert_eq!(lookup.queries().len(), 1);

    let delivered = notifier.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].status, RunStatus::Denied);
}

#[tokio::test]
async fn test_gate_scoped_to_merge_queue_ignores_push() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let lookup = Arc::new(
        StaticPullRequestLookup::empty().with_pull_request(open_pr(7, "release/2.0", "main")),
    );
    let engine = PipelineEngine::new("deploy", deploy_graph(), invoker)
        .unwrap()
        .with_gates(GateSet::new(vec![release_pr_gate().on([EventKind::MergeQueue])]))
        .with_lookup(lookup.clone());

    let run = engine.run(push_to_main()).await.unwrap();
    assert_eq!(run.status(), RunStatus::Succeeded);
    assert!(lookup.queries().is_empty());
}

#[tokio::test]
async fn test_failing_lookup_denies_run() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let engine = PipelineEngine::new("deploy", deploy_graph(), invoker.clone())
        .unwrap()
        .with_gates(GateSet::new(vec![release_pr_gate()]))
        .with_lookup(Arc::new(StaticPullRequestLookup::failing("HTTP 503")));

    let run = engine.run(push_to_main()).await.unwrap();
    assert_eq!(run.status(), RunStatus::Denied);
    assert!(run.denial_reason.unwrap().contains("HTTP 503"));
    assert!(invoker.invoked().is_empty());
}

#[tokio::test]
async fn test_gate_check_is_idempotent() {
    let engine = PipelineEngine::new("deploy", deploy_graph(), Arc::new(ScriptedInvoker::new()))
        .unwrap()
        .with_gates(GateSet::new(vec![release_pr_gate()]))
        .with_lookup(Arc::new(
            StaticPullRequestLookup::empty().with_pull_request(open_pr(3, "release/1", "main")),
        ));

    let first = engine.check_gates(&push_to_main()).await;
    let second = engine.check_gates(&push_to_main()).await;
    assert_eq!(first, second);
    assert!(!first.allowed());
}

#[tokio::test]
async fn test_without_halt_independent_branch_keeps_running() {
    // a -> b, c -> d: a fails, c and d are unaffected
    let graph = StageGraph::from_specs([
        stage("a", &[]),
        stage("c", &[]),
        stage("b", &["a"]),
        stage("d", &["c"]),
    ])
    .unwrap();
    let invoker = Arc::new(ScriptedInvoker::failing("a"));
    let engine = PipelineEngine::new("split", graph, invoker.clone())
        .unwrap()
        .with_settings(EngineSettings {
            halt_on_failure: false,
            ..EngineSettings::default()
        });

    let run = engine.run(push_to_main()).await.unwrap();
    assert_eq!(run.status(), RunStatus::Failed);
    assert_eq!(run.stage("b").unwrap().status, StageStatus::Skipped);
    assert_eq!(run.stage("d").unwrap().status, StageStatus::Succeeded);
    assert!(!invoker.was_invoked("b"));
}

#[tokio::test]
async fn test_halt_skips_unrelated_later_batches() {
    let graph = StageGraph::from_specs([
        stage("a", &[]),
        stage("c", &[]),
        stage("b", &["a"]),
        stage("d", &["c"]),
    ])
    .unwrap();
    let invoker = Arc::new(ScriptedInvoker::failing("a"));
    let engine = PipelineEngine::new("split", graph, invoker.clone()).unwrap();

    let run = engine.run(push_to_main()).await.unwrap();
    // c shares a's batch, so it still runs to completion
    assert_eq!(run.stage("c").unwrap().status, StageStatus::Succeeded);
    assert_eq!(run.stage("d").unwrap().status, StageStatus::Skipped);
    assert!(run
        .stage("d")
        .unwrap()
        .skip_reason
        .as_deref()
        .unwrap()
        .contains("halted after a failed"));
}

#[tokio::test]
async fn test_timeout_fails_stage_and_skips_dependents() {
    let invoker = Arc::new(ScriptedInvoker::new().with_step("test", ScriptedStep::Hang));
    let graph = StageGraph::from_specs([
        stage("lint", &[]),
        stage("test", &["lint"]).with_timeout(1),
        stage("deploy", &["test"]),
    ])
    .unwrap();
    let engine = PipelineEngine::new("deploy", graph, invoker.clone()).unwrap();

    let run = engine.run(push_to_main()).await.unwrap();
    let test = run.stage("test").unwrap();
    assert_eq!(test.status, StageStatus::Failed);
    assert_eq!(
        test.result.as_ref().unwrap().failure(),
        Some(&FailureReason::Timeout { after_secs: 1 })
    );
    assert_eq!(run.stage("deploy").unwrap().status, StageStatus::Skipped);
}

#[tokio::test]
async fn test_invoker_error_is_action_error() {
    let invoker = Arc::new(
        ScriptedInvoker::new().with_step("build", ScriptedStep::Error("registry down".into())),
    );
    let engine = PipelineEngine::new("deploy", deploy_graph(), invoker).unwrap();

    let run = engine.run(push_to_main()).await.unwrap();
    let build = run.stage("build").unwrap();
    assert!(matches!(
        build.result.as_ref().unwrap().failure(),
        Some(FailureReason::ActionError { detail }) if detail.contains("registry down")
    ));
    // deploy shares build's batch and still ran
    assert_eq!(run.stage("deploy").unwrap().status, StageStatus::Succeeded);
    assert_eq!(run.status(), RunStatus::Failed);
}

#[tokio::test]
async fn test_parallelism_is_bounded() {
    let specs: Vec<StageSpec> = (0..6).map(|i| stage(&format!("s{i}"), &[])).collect();
    let invoker = Arc::new(ScriptedInvoker::new().with_delay(Duration::from_millis(50)));
    let graph = StageGraph::from_specs(specs).unwrap();
    let engine = PipelineEngine::new("wide", graph, invoker.clone())
        .unwrap()
        .with_settings(EngineSettings {
            max_parallel: 2,
            ..EngineSettings::default()
        });

    let run = engine.run(push_to_main()).await.unwrap();
    assert_eq!(run.status(), RunStatus::Succeeded);
    assert!(invoker.peak_concurrency() <= 2);
    assert!(invoker.peak_concurrency() >= 1);
}

#[tokio::test]
async fn test_stage_starts_when_it_gets_a_slot() {
    let specs: Vec<StageSpec> = (0..3).map(|i| stage(&format!("s{i}"), &[])).collect();
    let invoker = Arc::new(ScriptedInvoker::new().with_delay(Duration::from_millis(150)));
    let engine = PipelineEngine::new("serial", StageGraph::from_specs(specs).unwrap(), invoker)
        .unwrap()
        .with_settings(EngineSettings {
            max_parallel: 1,
            ..EngineSettings::default()
        });

    let run = engine.run(push_to_main()).await.unwrap();
    assert_eq!(run.status(), RunStatus::Succeeded);

    let mut starts: Vec<_> = run
        .stages
        .iter()
        .map(|s| s.started_at.expect("every executed stage has a start time"))
        .collect();
    starts.sort();
    for pair in starts.windows(2) {
        let gap = (pair[1] - pair[0]).num_milliseconds();
        assert!(gap >= 100, "queued stage marked running {gap} ms after the previous one");
    }
}

#[tokio::test]
async fn test_skipped_stage_has_no_start_time() {
    let invoker = Arc::new(ScriptedInvoker::failing("lint"));
    let engine = PipelineEngine::new("deploy", deploy_graph(), invoker).unwrap();

    let run = engine.run(push_to_main()).await.unwrap();
    assert!(run.stage("lint").unwrap().started_at.is_some());
    assert!(run.stage("test").unwrap().started_at.is_none());
}

#[tokio::test]
async fn test_environment_layers_in_order() {
    let graph = StageGraph::from_specs([stage("deploy", &[])
        .with_env("TARGET", "stage-wins")
        .with_env("SHIPLINE_BRANCH", "overridden")])
    .unwrap();
    let invoker = Arc::new(ScriptedInvoker::new());
    let engine = PipelineEngine::new("deploy", graph, invoker.clone())
        .unwrap()
        .with_env(
            [
                ("TARGET".to_string(), "pipeline".to_string()),
                ("REGISTRY".to_string(), "ghcr.io/acme".to_string()),
                ("SHIPLINE_ACTOR".to_string(), "ignored".to_string()),
            ]
            .into(),
        );

    let run = engine.run(push_to_main()).await.unwrap();
    let env = &invoker.calls()[0].env;
    assert_eq!(env["TARGET"], "stage-wins");
    assert_eq!(env["REGISTRY"], "ghcr.io/acme");
    assert_eq!(env["SHIPLINE_ACTOR"], "alice");
    assert_eq!(env["SHIPLINE_BRANCH"], "overridden");
    assert_eq!(env["SHIPLINE_STAGE"], "deploy");
    assert_eq!(env["SHIPLINE_RUN_ID"], run.id.as_str());
}

#[tokio::test]
async fn test_notify_failure_does_not_change_outcome() {
    let notifier = Arc::new(FailingNotifier::new("github is down"));
    let engine = PipelineEngine::new("deploy", deploy_graph(), Arc::new(ScriptedInvoker::new()))
        .unwrap()
        .with_notifier(notifier.clone());

    let run = engine.run(push_to_main()).await.unwrap();
    assert_eq!(run.status(), RunStatus::Succeeded);
    assert_eq!(notifier.attempts(), 1);
}

#[tokio::test]
async fn test_terminal_runs_are_archived() {
    let history = Arc::new(MemoryRunHistory::new());
    let invoker = Arc::new(ScriptedInvoker::failing("test"));
    let engine = PipelineEngine::new("deploy", deploy_graph(), invoker)
        .unwrap()
        .with_history(history.clone());

    let run = engine.run(push_to_main()).await.unwrap();
    let entry = history.get(&run.id).await.unwrap();
    assert_eq!(entry.outcome, RunOutcome::Failed);
    assert_eq!(entry.stages.len(), 4);
    assert_eq!(entry.stages[1].stage_id, "test");
    assert_eq!(entry.stages[1].status, "failed");
}

#[tokio::test]
async fn test_denied_runs_are_archived_with_reason() {
    let history = Arc::new(MemoryRunHistory::new());
    let engine = PipelineEngine::new("deploy", deploy_graph(), Arc::new(ScriptedInvoker::new()))
        .unwrap()
        .with_gates(GateSet::new(vec![Gate::new(
            "pushes-only",
            GateRule::EventIn {
                any_of: vec![EventKind::Push],
            },
        )]))
        .with_history(history.clone());

    let run = engine
        .run(TriggerContext::new(EventKind::Manual, "main", "abc", "carol"))
        .await
        .unwrap();
    let entry = history.get(&run.id).await.unwrap();
    assert_eq!(entry.outcome, RunOutcome::Denied);
    assert!(entry.denial_reason.unwrap().starts_with("pushes-only: "));
}

#[test]
fn test_cycle_aborts_before_any_run() {
    let mut graph = StageGraph::new();
    graph.add_stage(stage("build", &["test"])).unwrap();
    let err = graph.add_stage(stage("test", &["build"])).unwrap_err();
    assert!(matches!(err, GraphError::Cycle { .. }));
}

#[test]
fn test_engine_rejects_dangling_dependency() {
    let graph = StageGraph::from_specs([stage("deploy", &["build"])]).unwrap();
    assert!(PipelineEngine::new("deploy", graph, Arc::new(ScriptedInvoker::new())).is_err());
}

#[tokio::test]
async fn test_definition_runs_real_processes() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("deployed");
    let input = format!(
        r#"
name = "local"

[settings]
default_timeout_secs = 30

[env]
TARGET = "{}"

[[stages]]
id = "build"
run = "echo built"

[[stages]]
id = "deploy"
depends_on = ["build"]
run = "touch \"$TARGET\""
"#,
        marker.display()
    );
    let def = PipelineDefinition::from_toml_str(&input).unwrap();
    let engine = PipelineEngine::from_definition(&def, Arc::new(ProcessInvoker)).unwrap();

    let run = engine.run(push_to_main()).await.unwrap();
    assert_eq!(run.status(), RunStatus::Succeeded);
    assert_eq!(run.definition_digest, def.digest().unwrap());
    assert!(run.stage("build").unwrap().result.as_ref().unwrap().output.stdout.contains("built"));
    assert!(marker.exists());
}
