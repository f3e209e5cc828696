//! End-to-end runs through `WorkflowEngine` against the in-memory store and
//! pub/sub.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Map, Value, json};
use stepflow_core::event::InProcessPubSub;
use stepflow_core::repository::memory::InMemoryWorkflowStore;
use stepflow_core::repository::workflow::WorkflowStore;
use stepflow_core::telemetry::{RecordingSink, TrackingSink};
use stepflow_core::workflow::{
    Condition, ConditionError, EngineError, ForeachOptions, ResumeOptions, SleepDuration, StartOptions, Step,
    StepContext, StepError, StepFlowEntry, TimeTravelOptions, Workflow, WorkflowEngine,
};
use stepflow_types::config::EngineConfig;
use stepflow_types::error::{
    DomainError, ErrorCategory, ErrorDomain, StoreError, WORKFLOW_CONDITION_EVALUATION_FAILED,
    WORKFLOW_SNAPSHOT_PERSIST_FAILED,
};
use stepflow_types::event::{WatchEvent, WorkflowEventType};
use stepflow_types::snapshot::{PersistSnapshotParams, WorkflowRunRecord, WorkflowSnapshot};
use stepflow_types::workflow::{LoopType, StepStatus, WorkflowRunStatus};
use tokio::sync::broadcast;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

type Engine = WorkflowEngine<InMemoryWorkflowStore, InProcessPubSub>;

struct Harness {
    store: Arc<InMemoryWorkflowStore>,
    sink: Arc<RecordingSink>,
    engine: Arc<Engine>,
}

fn harness() -> Harness {
    harness_on(Arc::new(InMemoryWorkflowStore::new()))
}

fn harness_on(store: Arc<InMemoryWorkflowStore>) -> Harness {
    let sink = Arc::new(RecordingSink::new());
    let tracker: Arc<dyn TrackingSink> = sink.clone();
    let engine = WorkflowEngine::new(
        store.clone(),
        Arc::new(InProcessPubSub::default()),
        tracker,
        EngineConfig::default(),
    );
    Harness {
        store,
        sink,
        engine: Arc::new(engine),
    }
}

fn add(id: &str, n: i64) -> Step {
    Step::from_fn(id, move |ctx: StepContext| async move {
        let x = ctx.input().as_i64().unwrap_or(0);
        Ok(json!(x + n))
    })
}

fn counted(id: &str, calls: Arc<AtomicUsize>) -> Step {
    Step::from_fn(id, move |ctx: StepContext| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ctx.input().clone())
        }
    })
}

/// Suspends until resumed, then outputs the resume data.
fn approval(id: &str, label: Option<&'static str>) -> Step {
    Step::from_fn(id, move |ctx: StepContext| async move {
        match ctx.resume_data() {
            Some(data) => Ok(data.clone()),
            None => match label {
                Some(label) => ctx.suspend_with_label(json!({ "reason": "approval" }), label),
                None => ctx.suspend(json!({ "reason": "approval" })),
            },
        }
    })
}

fn drain(rx: &mut broadcast::Receiver<WatchEvent>) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn of_type(events: &[WatchEvent], event_type: WorkflowEventType) -> Vec<&WatchEvent> {
    events.iter().filter(|e| e.event_type() == event_type).collect()
}

async fn wait_for_status(engine: &Engine, workflow: &Workflow, run_id: &str, status: WorkflowRunStatus) {
    for _ in 0..400 {
        if let Some(snapshot) = engine.get_run(workflow, run_id).await.unwrap() {
            if snapshot.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {run_id} never reached {status:?}");
}

// ---------------------------------------------------------------------------
// Sequential runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sequential_steps_chain_outputs() {
    let h = harness();
    let workflow = Workflow::builder("chain")
        .then(add("a", 1))
        .then(add("b", 10))
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!(1))).await.unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert_eq!(outcome.result, Some(json!(12)));
    assert_eq!(outcome.step("a").unwrap().output, Some(json!(2)));

    let snapshot = h.engine.get_run(&workflow, &outcome.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, WorkflowRunStatus::Success);
    assert_eq!(snapshot.result, Some(json!(12)));
    assert!(!h.engine.is_active(&outcome.run_id));
}

#[tokio::test]
async fn test_invalid_input_is_rejected_before_running() {
    let h = harness();
    let workflow = Workflow::builder("typed")
        .input_schema(json!({ "type": "object", "required": ["name"] }))
        .then(add("a", 1))
        .commit()
        .unwrap();

    let err = h
        .engine
        .start(&workflow, StartOptions::new(json!({ "other": 1 })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    assert_eq!(h.store.snapshot_writes(), 0);
}

#[tokio::test]
async fn test_failed_step_fails_run_and_skips_rest() {
    let h = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("failing")
        .then(Step::from_fn("boom", |_ctx: StepContext| async {
            Err(StepError::failed("exploded"))
        }))
        .then(counted("after", calls.clone()))
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!({}))).await.unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Failed);
    assert!(outcome.error.as_ref().unwrap().message.contains("exploded"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(outcome.step("after").is_none());
}

#[tokio::test]
async fn test_retries_until_success() {
    let h = harness();
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let workflow = Workflow::builder("flaky")
        .then(
            Step::from_fn("flaky", move |ctx: StepContext| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if ctx.retry_count() < 2 {
                        return Err(StepError::failed("not yet"));
                    }
                    Ok(json!(ctx.retry_count()))
                }
            })
            .retries(2),
        )
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!(null))).await.unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert_eq!(outcome.result, Some(json!(2)));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_bail_ends_run_early() {
    let h = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("bail")
        .then(Step::from_fn("gate", |ctx: StepContext| async move {
            ctx.bail(json!({ "early": true }))
        }))
        .then(counted("never", calls.clone()))
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!({}))).await.unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert_eq!(outcome.result, Some(json!({ "early": true })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_state_flows_between_steps() {
    let h = harness();
    let workflow = Workflow::builder("stateful")
        .then(Step::from_fn("write", |ctx: StepContext| async move {
            let mut state = ctx.state();
            state.insert("visits".into(), json!(1));
            ctx.set_state(state);
            Ok(json!(null))
        }))
        .then(Step::from_fn("read", |ctx: StepContext| async move {
            Ok(ctx.state().get("visits").cloned().unwrap_or(Value::Null))
        }))
        .commit()
        .unwrap();

    let mut initial = Map::new();
    initial.insert("owner".into(), json!("ops"));
    let outcome = h
        .engine
        .start(&workflow, StartOptions::new(json!({})).initial_state(initial))
        .await
        .unwrap();

    assert_eq!(outcome.result, Some(json!(1)));
    assert_eq!(outcome.state["owner"], json!("ops"));
    assert_eq!(outcome.state["visits"], json!(1));
}

// ---------------------------------------------------------------------------
// Suspend and resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_parallel_branches_resume_one_at_a_time() {
    let h = harness();
    let workflow = Workflow::builder("approvals")
        .then(add("prepare", 0))
        .parallel([approval("legal", None), approval("finance", None)])
        .then(Step::from_fn("report", |ctx: StepContext| async move { Ok(ctx.input().clone()) }))
        .commit()
        .unwrap();

    let started = h.engine.start(&workflow, StartOptions::new(json!(1))).await.unwrap();
    assert_eq!(started.status, WorkflowRunStatus::Suspended);
    assert_eq!(started.suspended["legal"], vec![1, 0]);
    assert_eq!(started.suspended["finance"], vec![1, 1]);

    let snapshot = h.engine.get_run(&workflow, &started.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, WorkflowRunStatus::Suspended);
    assert_eq!(snapshot.suspended_paths.len(), 2);

    let first = h
        .engine
        .resume(&workflow, ResumeOptions::new(&started.run_id, json!("legal ok")).step("legal"))
        .await
        .unwrap();
    assert_eq!(first.status, WorkflowRunStatus::Suspended);
    assert!(!first.suspended.contains_key("legal"));
    assert_eq!(first.suspended["finance"], vec![1, 1]);
    assert_eq!(first.step("legal").unwrap().status, StepStatus::Success);

    let second = h
        .engine
        .resume(&workflow, ResumeOptions::new(&started.run_id, json!("finance ok")).path(vec![1, 1]))
        .await
        .unwrap();
    assert_eq!(second.status, WorkflowRunStatus::Success);
    assert_eq!(
        second.result,
        Some(json!({ "legal": "legal ok", "finance": "finance ok" }))
    );
    let legal = second.step("legal").unwrap();
    assert_eq!(legal.suspend_payload, Some(json!({ "reason": "approval" })));
    assert_eq!(legal.resume_payload, Some(json!("legal ok")));
}

#[tokio::test]
async fn test_resume_by_label() {
    let h = harness();
    let workflow = Workflow::builder("labelled")
        .then(approval("review", Some("manager")))
        .commit()
        .unwrap();

    let started = h.engine.start(&workflow, StartOptions::new(json!({}))).await.unwrap();
    let snapshot = h.engine.get_run(&workflow, &started.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.resume_labels["manager"], vec![0]);

    let resumed = h
        .engine
        .resume(&workflow, ResumeOptions::new(&started.run_id, json!("approved")).label("manager"))
        .await
        .unwrap();
    assert_eq!(resumed.status, WorkflowRunStatus::Success);
    assert_eq!(resumed.result, Some(json!("approved")));

    let snapshot = h.engine.get_run(&workflow, &started.run_id).await.unwrap().unwrap();
    assert!(snapshot.resume_labels.is_empty());
}

#[tokio::test]
async fn test_resume_rejects_bad_targets() {
    let h = harness();
    let workflow = Workflow::builder("guarded")
        .then(approval("review", None))
        .commit()
        .unwrap();
    let started = h.engine.start(&workflow, StartOptions::new(json!({}))).await.unwrap();

    let err = h
        .engine
        .resume(&workflow, ResumeOptions::new(&started.run_id, json!(1)).path(vec![3]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResumePath { .. }));

    let err = h
        .engine
        .resume(&workflow, ResumeOptions::new(&started.run_id, json!(1)).step("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NothingToResume(_)));

    h.engine
        .resume(&workflow, ResumeOptions::new(&started.run_id, json!(1)))
        .await
        .unwrap();
    let err = h
        .engine
        .resume(&workflow, ResumeOptions::new(&started.run_id, json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidRunStatus {
            status: WorkflowRunStatus::Success,
            ..
        }
    ));
}

#[tokio::test]
async fn test_invalid_resume_data_fails_step() {
    let h = harness();
    let workflow = Workflow::builder("strict-resume")
        .then(approval("review", None).resume_schema(json!({ "type": "boolean" })))
        .commit()
        .unwrap();
    let started = h.engine.start(&workflow, StartOptions::new(json!({}))).await.unwrap();

    let resumed = h
        .engine
        .resume(&workflow, ResumeOptions::new(&started.run_id, json!("yes")))
        .await
        .unwrap();
    assert_eq!(resumed.status, WorkflowRunStatus::Failed);
    assert_eq!(resumed.step("review").unwrap().status, StepStatus::Failed);
}

// ---------------------------------------------------------------------------
// Composite entries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failing_condition_is_tracked_once_and_skipped() {
    let h = harness();
    let workflow = Workflow::builder("routing")
        .branch([
            (
                Condition::sync(|_ctx| Err(ConditionError::Other(anyhow::anyhow!("lookup failed")))),
                add("broken", 1),
            ),
            (
                Condition::sync(|ctx| Ok(ctx.input.as_i64() == Some(5))),
                add("five", 100),
            ),
        ])
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!(5))).await.unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert_eq!(outcome.result, Some(json!({ "five": 105 })));
    assert!(outcome.step("broken").is_none());

    let tracked = h.sink.errors();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].id, WORKFLOW_CONDITION_EVALUATION_FAILED);
    assert_eq!(tracked[0].details["runId"], json!(outcome.run_id));
    assert!(tracked[0].to_string().contains("Error evaluating condition"));
}

#[tokio::test]
async fn test_condition_domain_error_is_kept_as_cause() {
    let h = harness();
    let workflow = Workflow::builder("routing-domain")
        .branch([(
            Condition::sync(|_ctx| {
                Err(ConditionError::Domain(DomainError::new(
                    "PRICING_TABLE_MISSING",
                    ErrorDomain::Step,
                    ErrorCategory::ThirdParty,
                    "pricing table unavailable",
                )))
            }),
            add("priced", 1),
        )])
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!(5))).await.unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert!(outcome.step("priced").is_none());

    let tracked = h.sink.errors();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].id, WORKFLOW_CONDITION_EVALUATION_FAILED);
    let cause = tracked[0].domain_cause().expect("domain cause preserved");
    assert_eq!(cause.id, "PRICING_TABLE_MISSING");
    assert_eq!(cause.category, ErrorCategory::ThirdParty);
    assert!(tracked[0].to_string().contains("pricing table unavailable"));
}

#[tokio::test]
async fn test_conditional_without_match_outputs_empty_object() {
    let h = harness();
    let workflow = Workflow::builder("no-match")
        .branch([(Condition::sync(|_ctx| Ok(false)), add("skipped", 1))])
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!(1))).await.unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert_eq!(outcome.result, Some(json!({})));
}

#[tokio::test]
async fn test_dountil_and_dowhile_loops() {
    let h = harness();
    let until = Workflow::builder("until")
        .dountil(
            add("inc", 1),
            Condition::sync(|ctx| Ok(ctx.input.as_i64().unwrap_or(0) >= 3)),
        )
        .commit()
        .unwrap();
    let outcome = h.engine.start(&until, StartOptions::new(json!(0))).await.unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert_eq!(outcome.result, Some(json!(3)));

    let iterations = Arc::new(AtomicU32::new(0));
    let seen = iterations.clone();
    let during = Workflow::builder("while")
        .dowhile(
            add("inc", 2),
            Condition::sync(move |ctx| {
                seen.store(ctx.iteration_count, Ordering::SeqCst);
                Ok(ctx.input.as_i64().unwrap_or(0) < 5)
            }),
        )
        .commit()
        .unwrap();
    let outcome = h.engine.start(&during, StartOptions::new(json!(0))).await.unwrap();
    assert_eq!(outcome.result, Some(json!(6)));
    assert_eq!(iterations.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_loop_condition_error_fails_the_loop() {
    let h = harness();
    let workflow = Workflow::builder("broken-loop")
        .dowhile(
            add("inc", 1),
            Condition::sync(|_ctx| Err(ConditionError::Other(anyhow::anyhow!("counter store offline")))),
        )
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!(0))).await.unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Failed);
    let inc = outcome.step("inc").unwrap();
    assert_eq!(inc.status, StepStatus::Failed);
    assert_eq!(inc.payload, Some(json!(0)));
    assert!(inc.error.as_ref().unwrap().message.contains("counter store offline"));
    assert_eq!(h.sink.errors()[0].id, WORKFLOW_CONDITION_EVALUATION_FAILED);
}

#[tokio::test]
async fn test_foreach_preserves_item_order() {
    let h = harness();
    let workflow = Workflow::builder("fanout")
        .foreach(
            Step::from_fn("square", |ctx: StepContext| async move {
                let x = ctx.input().as_i64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis((10 - x as u64) * 2)).await;
                Ok(json!(x * x))
            }),
            ForeachOptions::concurrency(3),
        )
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!([1, 2, 3, 4]))).await.unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert_eq!(outcome.result, Some(json!([1, 4, 9, 16])));
}

#[tokio::test]
async fn test_foreach_rejects_non_array_input() {
    let h = harness();
    let workflow = Workflow::builder("fanout")
        .foreach(add("inc", 1), ForeachOptions::default())
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!({ "not": "a list" }))).await.unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Failed);
}

#[tokio::test]
async fn test_foreach_collects_errors() {
    let h = harness();
    let workflow = Workflow::builder("fanout")
        .foreach(
            Step::from_fn("check", |ctx: StepContext| async move {
                match ctx.input().as_i64() {
                    Some(x) if x % 2 == 0 => Err(StepError::failed(format!("{x} is even"))),
                    other => Ok(json!(other)),
                }
            }),
            ForeachOptions::concurrency(2).collect_errors(),
        )
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!([1, 2, 3, 4]))).await.unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Failed);
    assert_eq!(outcome.error.as_ref().unwrap().message, "2 of 4 foreach items failed");

    let check = outcome.step("check").unwrap();
    assert_eq!(check.metadata["foreachErrors"].as_array().unwrap().len(), 2);
    assert_eq!(
        check.metadata["foreachStatuses"],
        json!(["success", "failed", "success", "failed"])
    );
}

#[tokio::test]
async fn test_foreach_resume_reruns_only_suspended_item() {
    let h = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let workflow = Workflow::builder("review-items")
        .foreach(
            Step::from_fn("review", move |ctx: StepContext| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    let x = ctx.input().as_i64().unwrap_or(0);
                    if let Some(data) = ctx.resume_data() {
                        return Ok(data.clone());
                    }
                    if x == 2 {
                        return ctx.suspend(json!({ "item": x }));
                    }
                    Ok(json!(x * 10))
                }
            }),
            ForeachOptions::concurrency(2),
        )
        .commit()
        .unwrap();

    let started = h.engine.start(&workflow, StartOptions::new(json!([1, 2, 3]))).await.unwrap();
    assert_eq!(started.status, WorkflowRunStatus::Suspended);
    assert_eq!(started.suspended["review"], vec![0, 1]);
    assert_eq!(
        started.step("review").unwrap().metadata["foreachStatuses"],
        json!(["success", "suspended", "success"])
    );

    let resumed = h
        .engine
        .resume(&workflow, ResumeOptions::new(&started.run_id, json!(25)).path(vec![0, 1]))
        .await
        .unwrap();
    assert_eq!(resumed.status, WorkflowRunStatus::Success);
    assert_eq!(resumed.result, Some(json!([10, 25, 30])));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

// ---------------------------------------------------------------------------
// Sleep, events and persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sleep_publishes_waiting_once_and_persists_twice() {
    let h = harness();
    let workflow = Workflow::builder("nap")
        .then(add("a", 1))
        .sleep(Duration::from_millis(20))
        .then(add("b", 1))
        .commit()
        .unwrap();
    let mut events = h.engine.watch("run-nap");

    let outcome = h
        .engine
        .start(&workflow, StartOptions::new(json!(1)).run_id("run-nap"))
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert_eq!(outcome.result, Some(json!(3)));

    let events = drain(&mut events);
    let waiting = of_type(&events, WorkflowEventType::WorkflowStepWaiting);
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].data.payload["id"], json!("sleep-1"));
    assert!(waiting[0].data.payload["wakeAt"].is_i64());

    let sleep_results: Vec<_> = of_type(&events, WorkflowEventType::WorkflowStepResult)
        .into_iter()
        .filter(|e| e.data.payload["id"] == json!("sleep-1"))
        .collect();
    assert_eq!(sleep_results.len(), 1);
    assert_eq!(events.first().unwrap().event_type(), WorkflowEventType::WorkflowStart);
    assert_eq!(events.last().unwrap().event_type(), WorkflowEventType::WorkflowFinish);

    // a, sleep waiting, sleep running, b, final. The engine's own update at
    // the sleep's path replays the sleep's write.
    assert_eq!(h.store.snapshot_writes(), 5);
    assert_eq!(outcome.step("sleep-1").unwrap().status, StepStatus::Success);
}

#[tokio::test]
async fn test_sleep_inside_loop_runs_every_iteration() {
    let h = harness();
    let workflow = Workflow::builder("naps")
        .entry(StepFlowEntry::Loop {
            id: "nap-loop".to_string(),
            step: Box::new(StepFlowEntry::Sleep {
                id: "nap".to_string(),
                duration: SleepDuration::Fixed(Duration::from_millis(1)),
            }),
            condition: Condition::sync(|ctx| Ok(ctx.iteration_count < 3)),
            loop_type: LoopType::DoWhile,
        })
        .commit()
        .unwrap();
    let mut events = h.engine.watch("run-naps");

    let outcome = h
        .engine
        .start(&workflow, StartOptions::new(json!("zzz")).run_id("run-naps"))
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert_eq!(outcome.result, Some(json!("zzz")));

    let events = drain(&mut events);
    assert_eq!(of_type(&events, WorkflowEventType::WorkflowStepWaiting).len(), 3);
    let nap_results = of_type(&events, WorkflowEventType::WorkflowStepResult)
        .into_iter()
        .filter(|e| e.data.payload["id"] == json!("nap"))
        .count();
    assert_eq!(nap_results, 3);

    // Waiting and running per iteration, the loop's update, final.
    assert_eq!(h.store.snapshot_writes(), 8);
}

#[tokio::test]
async fn test_finished_run_clears_durable_records() {
    let h = harness();
    let workflow = Workflow::builder("tidy")
        .then(add("a", 1))
        .sleep(Duration::from_millis(5))
        .then(add("b", 1))
        .commit()
        .unwrap();

    let outcome = h.engine.start(&workflow, StartOptions::new(json!(1))).await.unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert_eq!(h.store.operation_count(), 0);

    let parked = Workflow::builder("parked-tidy").then(approval("review", None)).commit().unwrap();
    let suspended = h.engine.start(&parked, StartOptions::new(json!({}))).await.unwrap();
    assert_eq!(suspended.status, WorkflowRunStatus::Suspended);
    assert!(h.store.operation_count() > 0);

    assert!(h.engine.cancel(&parked, &suspended.run_id).await.unwrap());
    assert_eq!(h.store.operation_count(), 0);
}

#[tokio::test]
async fn test_step_events_are_ordered_per_step() {
    let h = harness();
    let workflow = Workflow::builder("events").then(add("only", 1)).commit().unwrap();
    let mut rx = h.engine.watch("run-events");

    h.engine
        .start(&workflow, StartOptions::new(json!(1)).run_id("run-events"))
        .await
        .unwrap();

    let kinds: Vec<WorkflowEventType> = drain(&mut rx).iter().map(WatchEvent::event_type).collect();
    assert_eq!(
        kinds,
        vec![
            WorkflowEventType::WorkflowStart,
            WorkflowEventType::WorkflowStepStart,
            WorkflowEventType::WorkflowStepResult,
            WorkflowEventType::WorkflowStepFinish,
            WorkflowEventType::WorkflowFinish,
        ]
    );
}

// ---------------------------------------------------------------------------
// Cancel, restart and time travel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_active_run_during_sleep() {
    let h = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("long-nap")
        .sleep(Duration::from_secs(30))
        .then(counted("after", calls.clone()))
        .commit()
        .unwrap();

    let engine = h.engine.clone();
    let wf = workflow.clone();
    let task = tokio::spawn(async move {
        engine
            .start(&wf, StartOptions::new(json!({})).run_id("run-cancel"))
            .await
    });
    wait_for_status(&h.engine, &workflow, "run-cancel", WorkflowRunStatus::Waiting).await;

    assert!(h.engine.cancel(&workflow, "run-cancel").await.unwrap());
    let outcome = task.await.unwrap().unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Canceled);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let snapshot = h.engine.get_run(&workflow, "run-cancel").await.unwrap().unwrap();
    assert_eq!(snapshot.status, WorkflowRunStatus::Canceled);
    assert!(!h.engine.cancel(&workflow, "run-cancel").await.unwrap());
}

#[tokio::test]
async fn test_cancel_stored_suspended_run() {
    let h = harness();
    let workflow = Workflow::builder("parked").then(approval("review", None)).commit().unwrap();
    let started = h.engine.start(&workflow, StartOptions::new(json!({}))).await.unwrap();

    assert!(h.engine.cancel(&workflow, &started.run_id).await.unwrap());
    let snapshot = h.engine.get_run(&workflow, &started.run_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, WorkflowRunStatus::Canceled);

    let err = h.engine.cancel(&workflow, "nope").await.unwrap_err();
    assert!(matches!(err, EngineError::RunNotFound { .. }));
}

#[tokio::test]
async fn test_restart_rearms_waiting_sleep_without_rerunning_steps() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let first = harness_on(store.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("crashy")
        .then(counted("a", calls.clone()))
        .sleep(Duration::from_millis(150))
        .then(add("b", 1))
        .commit()
        .unwrap();

    let engine = first.engine.clone();
    let wf = workflow.clone();
    let task = tokio::spawn(async move {
        engine
            .start(&wf, StartOptions::new(json!(1)).run_id("run-crash"))
            .await
    });
    wait_for_status(&first.engine, &workflow, "run-crash", WorkflowRunStatus::Waiting).await;
    task.abort();
    let _ = task.await;

    let second = harness_on(store);
    let outcome = second.engine.restart(&workflow, "run-crash").await.unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Success);
    assert_eq!(outcome.result, Some(json!(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let err = second.engine.restart(&workflow, "run-crash").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRunStatus { .. }));
}

#[tokio::test]
async fn test_time_travel_reruns_from_step() {
    let h = harness();
    let a_calls = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("travel")
        .then(counted("a", a_calls.clone()))
        .then(add("b", 1))
        .then(add("c", 10))
        .commit()
        .unwrap();

    let first = h.engine.start(&workflow, StartOptions::new(json!(1))).await.unwrap();
    assert_eq!(first.result, Some(json!(12)));

    let travelled = h
        .engine
        .time_travel(&workflow, TimeTravelOptions::new(&first.run_id, "b").input(json!(100)))
        .await
        .unwrap();
    assert_eq!(travelled.status, WorkflowRunStatus::Success);
    assert_eq!(travelled.result, Some(json!(111)));
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);

    let err = h
        .engine
        .time_travel(&workflow, TimeTravelOptions::new(&first.run_id, "zzz"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownStep(_)));
}

#[tokio::test]
async fn test_list_runs_includes_resource() {
    let h = harness();
    let workflow = Workflow::builder("listed").then(add("a", 1)).commit().unwrap();
    h.engine
        .start(&workflow, StartOptions::new(json!(1)).run_id("r1").resource_id("tenant-9"))
        .await
        .unwrap();

    let runs = h.engine.list_runs(&workflow).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, "r1");
    assert_eq!(runs[0].resource_id.as_deref(), Some("tenant-9"));
    assert_eq!(runs[0].status, WorkflowRunStatus::Success);
}

// ---------------------------------------------------------------------------
// Storage failure
// ---------------------------------------------------------------------------

/// Store whose snapshot writes always fail.
struct BrokenSnapshots(InMemoryWorkflowStore);

impl WorkflowStore for BrokenSnapshots {
    async fn persist_workflow_snapshot(&self, _params: PersistSnapshotParams) -> Result<(), StoreError> {
        Err(StoreError::Backend("disk full".into()))
    }

    async fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> Result<Option<WorkflowSnapshot>, StoreError> {
        self.0.load_workflow_snapshot(workflow_name, run_id).await
    }

    async fn list_workflow_runs(&self, workflow_name: &str) -> Result<Vec<WorkflowRunRecord>, StoreError> {
        self.0.list_workflow_runs(workflow_name).await
    }

    async fn delete_workflow_snapshot(&self, workflow_name: &str, run_id: &str) -> Result<bool, StoreError> {
        self.0.delete_workflow_snapshot(workflow_name, run_id).await
    }

    async fn load_operation_result(&self, operation_id: &str) -> Result<Option<Value>, StoreError> {
        self.0.load_operation_result(operation_id).await
    }

    async fn save_operation_result(&self, operation_id: &str, result: &Value) -> Result<(), StoreError> {
        self.0.save_operation_result(operation_id, result).await
    }

    async fn clear_operation_results(&self, prefix: &str) -> Result<u64, StoreError> {
        self.0.clear_operation_results(prefix).await
    }
}

#[tokio::test]
async fn test_storage_failure_fails_run() {
    let sink = Arc::new(RecordingSink::new());
    let tracker: Arc<dyn TrackingSink> = sink.clone();
    let engine = WorkflowEngine::new(
        Arc::new(BrokenSnapshots(InMemoryWorkflowStore::new())),
        Arc::new(InProcessPubSub::default()),
        tracker,
        EngineConfig::default(),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("unlucky")
        .then(add("a", 1))
        .then(counted("b", calls.clone()))
        .commit()
        .unwrap();

    let outcome = engine.start(&workflow, StartOptions::new(json!(1))).await.unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Failed);
    assert_eq!(
        outcome.error.unwrap().id.as_deref(),
        Some(WORKFLOW_SNAPSHOT_PERSIST_FAILED)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(sink.errors().len(), 1);
}

// ---------------------------------------------------------------------------
// Spans
// ---------------------------------------------------------------------------

/// Records the name and fields of every span opened.
#[derive(Clone, Default)]
struct SpanRecorder(Arc<std::sync::Mutex<Vec<(String, String)>>>);

struct FieldText(String);

impl tracing::field::Visit for FieldText {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.push_str(&format!("{}={:?} ", field.name(), value));
    }
}

impl<S: tracing::Subscriber> Layer<S> for SpanRecorder {
    fn on_new_span(&self, attrs: &tracing::span::Attributes<'_>, _id: &tracing::span::Id, _ctx: Context<'_, S>) {
        let mut fields = FieldText(String::new());
        attrs.record(&mut fields);
        self.0
            .lock()
            .unwrap()
            .push((attrs.metadata().name().to_string(), fields.0));
    }
}

impl SpanRecorder {
    fn named(&self, name: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, fields)| fields.clone())
            .collect()
    }
}

#[tokio::test]
async fn test_runs_and_entries_open_spans() {
    let recorder = SpanRecorder::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(recorder.clone()));

    let h = harness();
    let workflow = Workflow::builder("traced")
        .then(add("a", 1))
        .parallel([add("left", 1), add("right", 2)])
        .commit()
        .unwrap();
    h.engine
        .start(&workflow, StartOptions::new(json!(1)).run_id("run-traced"))
        .await
        .unwrap();

    let runs = recorder.named("workflow.run");
    assert_eq!(runs.len(), 1);
    assert!(runs[0].contains("traced"), "{}", runs[0]);
    assert!(runs[0].contains("run-traced"), "{}", runs[0]);

    // a, the parallel block and its two branches.
    let entries = recorder.named("workflow.entry");
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().any(|f| f.contains("\"left\"") && f.contains("[1, 0]")));
}
