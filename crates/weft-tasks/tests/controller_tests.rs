//! Controller scenarios over the in-memory repository and transport.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use common::{GatedRepository, Harness, tenant};
use weft_tasks::Error;
use weft_tasks::config::ControllerConfig;
use weft_tasks::context::ServiceContext;
use weft_tasks::controller::{CANCEL_BATCH_SIZE, TaskController};
use weft_tasks::events::{EventRecord, InternalTaskEvent};
use weft_tasks::messages::{
    CancelTasksPayload, CheckTenantQueues, DurableCallbackCompleted, FinishedRunCandidate,
    Message, ReplayTask, ReplayTasksPayload, TaskCancellationSignal, TaskCancelledPayload,
    TaskCompletedPayload, TaskFailedPayload, WakeReason, WorkflowNameTrigger,
};
use weft_tasks::olap::{OlapEventType, OlapRecord};
use weft_tasks::pool::OperationKind;
use weft_tasks::repository::memory::{
    InMemoryRepository, MatchAction, MatchCondition, RepositoryOptions, TaskStatus,
    WorkflowDefinition,
};
use weft_tasks::repository::Tenant;
use weft_tasks::task::{CancelReason, RetryPolicy, TaskRef};
use weft_tasks::transport::memory::InMemoryTransport;
use weft_tasks::transport::{Queue, Transport};

fn failed(task: &TaskRef) -> TaskFailedPayload {
    TaskFailedPayload {
        task: task.clone(),
        error_message: "boom".into(),
        is_app_error: true,
        should_not_retry: false,
        worker_id: Some("w1".into()),
    }
}

#[tokio::test]
async fn unknown_message_kind_is_a_hard_error() {
    let h = Harness::new();
    let mut message = Message::single(tenant(), &EventRecord::new("k", json!({}))).unwrap();
    message.kind = "bogus".into();

    let err = h.controller.handle_batch(&message).await.unwrap_err();
    assert!(matches!(err, Error::UnknownMessageKind { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn completion_wakes_scheduler_and_event_consumer() {
    let h = Harness::new();
    h.register(WorkflowDefinition::new("job", ["run"]).with_queue("fast"));
    let attempt = h.seed_running("job", "w1").await;

    let payload = TaskCompletedPayload {
        task: attempt.clone(),
        output: json!({"rows": 3}),
    };
    h.controller
        .handle_batch(&Message::single(tenant(), &payload).unwrap())
        .await
        .unwrap();

    assert_eq!(
        h.repo.task_status(&tenant(), attempt.id),
        Some(TaskStatus::Completed)
    );
    let wakes = h
        .transport
        .payloads::<CheckTenantQueues>(&Harness::scheduler_queue());
    assert_eq!(wakes.len(), 1);
    assert_eq!(wakes[0].reason, WakeReason::SlotsReleased);
    assert_eq!(wakes[0].queue_names, vec!["fast".to_string()]);

    let finished = h
        .transport
        .payloads::<FinishedRunCandidate>(&Queue::TenantEventConsumer(tenant()));
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].task, attempt);

    let events = h.task_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, OlapEventType::Completed);
}

#[tokio::test]
async fn signaling_failure_never_rolls_back_completion() {
    let h = Harness::new();
    h.register(WorkflowDefinition::new("job", ["run"]));
    let attempt = h.seed_running("job", "w1").await;
    h.transport.fail_sends_to(Harness::scheduler_queue());
    h.transport
        .fail_sends_to(Queue::TenantEventConsumer(tenant()));
    h.transport.fail_sends_to(Queue::TaskProcessing);

    let payload = TaskCompletedPayload {
        task: attempt.clone(),
        output: json!("done"),
    };
    h.controller
        .handle_batch(&Message::single(tenant(), &payload).unwrap())
        .await
        .unwrap();

    assert_eq!(
        h.repo.task_status(&tenant(), attempt.id),
        Some(TaskStatus::Completed)
    );
    assert_eq!(h.repo.task_output(&tenant(), attempt.id), Some(json!("done")));
}

#[tokio::test]
async fn failure_with_retries_left_emits_retrying_instead_of_internal_event() {
    let h = Harness::new();
    h.register(
        WorkflowDefinition::new("job", ["run"]).with_retries(1, RetryPolicy::default()),
    );
    let attempt = h.seed_running("job", "w1").await;

    h.controller
        .handle_batch(&Message::single(tenant(), &failed(&attempt)).unwrap())
        .await
        .unwrap();

    assert_eq!(
        h.repo.task_status(&tenant(), attempt.id),
        Some(TaskStatus::Backoff)
    );
    assert!(h.transport.messages(&Queue::TaskProcessing).is_empty());

    let events = h.task_events().await;
    let types: Vec<OlapEventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![OlapEventType::Failed, OlapEventType::Retrying]);
    assert_eq!(events[1].message, "retrying immediately");

    let wakes = h
        .transport
        .payloads::<CheckTenantQueues>(&Harness::scheduler_queue());
    assert_eq!(wakes[0].reason, WakeReason::SlotsReleased);

    // Backoff elapsed: the retry pool re-queues the next attempt.
    let more = h.controller.process_retry_queue_items(&tenant()).await.unwrap();
    assert!(!more);
    let task = h.repo.task(&tenant(), attempt.id).unwrap();
    assert_eq!(task.task_ref.retry_count, 1);
    assert_eq!(h.repo.task_status(&tenant(), attempt.id), Some(TaskStatus::Queued));

    let queued: Vec<_> = h
        .task_events()
        .await
        .into_iter()
        .filter(|e| e.event_type == OlapEventType::Queued)
        .collect();
    assert_eq!(queued.len(), 1);
    let wakes = h
        .transport
        .payloads::<CheckTenantQueues>(&Harness::scheduler_queue());
    assert_eq!(wakes.last().unwrap().reason, WakeReason::TasksCreated);
}

#[tokio::test]
async fn retry_delay_is_reported_in_seconds() {
    let h = Harness::new();
    h.register(
        WorkflowDefinition::new("job", ["run"]).with_retries(3, RetryPolicy::exponential(2.0, 60)),
    );
    let attempt = h.seed_running("job", "w1").await;

    h.controller
        .handle_task_failed(&tenant(), vec![failed(&attempt)])
        .await
        .unwrap();

    let retrying = h
        .task_events()
        .await
        .into_iter()
        .find(|e| e.event_type == OlapEventType::Retrying)
        .unwrap();
    assert_eq!(retrying.message, "retrying in 2s");
    assert_eq!(retrying.payload["retryDelayMs"], json!(2000));
    assert_eq!(retrying.payload["appRetryCount"], json!(1));
}

#[tokio::test]
async fn duplicate_failure_is_not_double_counted() {
    let h = Harness::new();
    h.register(
        WorkflowDefinition::new("job", ["run"]).with_retries(3, RetryPolicy::default()),
    );
    let attempt = h.seed_running("job", "w1").await;
    let message = Message::single(tenant(), &failed(&attempt)).unwrap();

    h.controller.handle_batch(&message).await.unwrap();
    h.controller.handle_batch(&message).await.unwrap();

    let task = h.repo.task(&tenant(), attempt.id).unwrap();
    assert_eq!(task.app_retry_count, 1);
    assert_eq!(h.repo.retry_queue_len(&tenant()), 1);

    let retrying = h
        .task_events()
        .await
        .into_iter()
        .filter(|e| e.event_type == OlapEventType::Retrying)
        .count();
    assert_eq!(retrying, 1);
}

#[tokio::test]
async fn final_failure_forwards_internal_event() {
    let h = Harness::new();
    h.register(WorkflowDefinition::new("job", ["run"]));
    let attempt = h.seed_running("job", "w1").await;

    h.controller
        .handle_task_failed(&tenant(), vec![failed(&attempt)])
        .await
        .unwrap();

    let forwarded = h.transport.messages(&Queue::TaskProcessing);
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].kind, "internal-event");
    assert_eq!(h.repo.task_status(&tenant(), attempt.id), Some(TaskStatus::Failed));
}

#[tokio::test]
async fn stalled_monitoring_sink_does_not_hold_up_failures() {
    let h = Harness::with_stalled_olap(ControllerConfig {
        olap_max_batch: 1,
        ..ControllerConfig::default()
    });
    h.register(WorkflowDefinition::new("job", ["run"]));

    let mut attempts = Vec::new();
    for _ in 0..40 {
        attempts.push(h.seed_running("job", "w1").await);
    }
    for attempt in &attempts {
        tokio::time::timeout(
            Duration::from_secs(5),
            h.controller.handle_task_failed(&tenant(), vec![failed(attempt)]),
        )
        .await
        .expect("failure handling finished")
        .unwrap();
    }

    for attempt in &attempts {
        assert_eq!(h.repo.task_status(&tenant(), attempt.id), Some(TaskStatus::Failed));
    }
    let forwarded = h
        .transport
        .payloads::<InternalTaskEvent>(&Queue::TaskProcessing);
    assert_eq!(forwarded.len(), 40);
    assert!(h.ctx.publisher.dropped() > 0);
}

#[tokio::test]
async fn cancellation_signals_the_workers_dispatcher() {
    let h = Harness::new();
    h.register(WorkflowDefinition::new("job", ["run"]));
    h.repo.register_worker(&tenant(), "w1", "d1").unwrap();
    let attempt = h.seed_running("job", "w1").await;

    let payload = TaskCancelledPayload {
        task: attempt.clone(),
        reason: CancelReason::CancelledByUser,
        should_notify_worker: true,
    };
    h.controller
        .handle_task_cancelled(&tenant(), vec![payload])
        .await
        .unwrap();

    let signals = h
        .transport
        .payloads::<TaskCancellationSignal>(&Queue::Dispatcher("d1".into()));
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].worker_id, "w1");
    assert_eq!(signals[0].reason, CancelReason::CancelledByUser);

    let events = h.task_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, OlapEventType::Cancelled);
    assert_eq!(events[0].message, "cancelled by user");
}

#[tokio::test]
async fn bulk_cancellation_is_chunked() {
    let h = Harness::new();
    let tasks: Vec<TaskRef> = (0..137)
        .map(|id| TaskRef::new(id, Utc::now(), 0, weft_core::TaskExternalId::generate()))
        .collect();

    h.controller
        .handle_cancel_tasks(
            &tenant(),
            vec![CancelTasksPayload {
                tasks,
                reason: CancelReason::CancelledByUser,
            }],
        )
        .await
        .unwrap();

    let batches = h.transport.messages(&Queue::TaskProcessing);
    let sizes: Vec<usize> = batches.iter().map(|m| m.payloads.len()).collect();
    assert_eq!(sizes, vec![CANCEL_BATCH_SIZE, CANCEL_BATCH_SIZE, 37]);
    assert!(batches.iter().all(|m| m.kind == "task-cancelled"));
}

#[tokio::test]
async fn replay_restarts_failed_tasks() {
    let h = Harness::new();
    h.register(WorkflowDefinition::new("job", ["run"]));
    let attempt = h.seed_running("job", "w1").await;
    h.controller
        .handle_task_failed(&tenant(), vec![failed(&attempt)])
        .await
        .unwrap();

    let request = ReplayTasksPayload {
        tasks: vec![ReplayTask {
            task: attempt.clone(),
            workflow_run_id: None,
        }],
    };
    h.controller
        .handle_replay_tasks(&tenant(), vec![request])
        .await
        .unwrap();

    assert_eq!(h.repo.task_status(&tenant(), attempt.id), Some(TaskStatus::Queued));
    let queued = h
        .task_events()
        .await
        .into_iter()
        .filter(|e| e.event_type == OlapEventType::Queued)
        .count();
    assert_eq!(queued, 1);
}

#[tokio::test]
async fn replay_is_ignored_when_disabled() {
    let h = Harness::with(
        RepositoryOptions::default(),
        ControllerConfig {
            replay_enabled: false,
            ..ControllerConfig::default()
        },
    );
    h.register(WorkflowDefinition::new("job", ["run"]));
    let attempt = h.seed_running("job", "w1").await;
    h.controller
        .handle_task_failed(&tenant(), vec![failed(&attempt)])
        .await
        .unwrap();

    let request = ReplayTasksPayload {
        tasks: vec![ReplayTask {
            task: attempt.clone(),
            workflow_run_id: None,
        }],
    };
    h.controller
        .handle_replay_tasks(&tenant(), vec![request])
        .await
        .unwrap();

    assert_eq!(h.repo.task_status(&tenant(), attempt.id), Some(TaskStatus::Failed));
}

#[tokio::test]
async fn event_without_runs_is_seen_once() {
    let h = Harness::new();
    h.register(WorkflowDefinition::new("job", ["run"]).on_event("order.created"));

    h.controller
        .handle_process_user_events(&tenant(), vec![EventRecord::new("unrelated", json!({}))])
        .await
        .unwrap();

    let seen: Vec<_> = h
        .olap_records()
        .await
        .into_iter()
        .filter_map(|record| match record {
            OlapRecord::EventSeen(seen) => Some(seen),
            _ => None,
        })
        .collect();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].key, "unrelated");
    assert!(seen[0].run.is_none());
}

#[tokio::test]
async fn event_triggers_workflow_and_wakes_scheduler() {
    let h = Harness::new();
    h.register(WorkflowDefinition::new("job", ["run"]).on_event("order.created"));

    h.controller
        .handle_process_user_events(
            &tenant(),
            vec![EventRecord::new("order.created", json!({"id": 7}))],
        )
        .await
        .unwrap();

    let records = h.olap_records().await;
    assert!(records.iter().any(|r| matches!(r, OlapRecord::TaskCreated { .. })));
    assert!(
        records
            .iter()
            .any(|r| matches!(r, OlapRecord::EventSeen(seen) if seen.run.is_some()))
    );
    let wakes = h
        .transport
        .payloads::<CheckTenantQueues>(&Harness::scheduler_queue());
    assert_eq!(wakes.len(), 1);
    assert_eq!(wakes[0].reason, WakeReason::TasksCreated);
}

#[tokio::test]
async fn satisfied_callback_reaches_dispatcher() {
    let h = Harness::new();
    h.repo.register_worker(&tenant(), "w1", "d1").unwrap();
    let waiting = weft_core::TaskExternalId::generate();
    h.repo
        .add_condition(
            &tenant(),
            MatchCondition {
                key: "approval".into(),
                resource_hint: None,
                action: MatchAction::SatisfyCallback {
                    task_external_id: waiting,
                    node_id: 4,
                    worker_id: "w1".into(),
                },
            },
        )
        .unwrap();

    h.controller
        .handle_process_user_events(&tenant(), vec![EventRecord::new("approval", json!(true))])
        .await
        .unwrap();

    let completions = h
        .transport
        .payloads::<DurableCallbackCompleted>(&Queue::Dispatcher("d1".into()));
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].task_external_id, waiting);
    assert_eq!(completions[0].node_id, 4);
    assert_eq!(completions[0].payload, json!(true));
}

#[tokio::test]
async fn timed_out_task_is_failed_and_worker_told() {
    let h = Harness::new();
    h.register(WorkflowDefinition::new("job", ["run"]).with_timeout_secs(5));
    h.repo.register_worker(&tenant(), "w1", "d1").unwrap();
    let task = h.seed("job").await;
    h.repo
        .assign_task(
            &tenant(),
            task.task_ref.id,
            "w1",
            Utc::now() - chrono::Duration::seconds(10),
        )
        .unwrap();

    let more = h.controller.process_task_timeouts(&tenant()).await.unwrap();
    assert!(!more);

    let signals = h
        .transport
        .payloads::<TaskCancellationSignal>(&Queue::Dispatcher("d1".into()));
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].reason, CancelReason::Timeout);

    let timed_out = h
        .task_events()
        .await
        .into_iter()
        .find(|e| e.event_type == OlapEventType::TimedOut)
        .unwrap();
    assert_eq!(timed_out.message, "exceeded timeout of 5s");
    assert_eq!(
        h.repo.task_status(&tenant(), task.task_ref.id),
        Some(TaskStatus::Failed)
    );
}

#[tokio::test]
async fn exhausted_reassignment_fails_without_reassigned_event() {
    let h = Harness::with(
        RepositoryOptions {
            max_reassignments: 0,
            ..RepositoryOptions::default()
        },
        ControllerConfig::default(),
    );
    h.register(WorkflowDefinition::new("job", ["run"]));
    let task = h.seed("job").await;
    h.repo
        .assign_task(
            &tenant(),
            task.task_ref.id,
            "w1",
            Utc::now() - chrono::Duration::seconds(120),
        )
        .unwrap();

    h.controller
        .process_task_reassignments(&tenant())
        .await
        .unwrap();

    let events = h.task_events().await;
    let reassigned = events
        .iter()
        .filter(|e| e.event_type == OlapEventType::Reassigned)
        .count();
    let exhausted: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == OlapEventType::Failed)
        .collect();
    assert_eq!(reassigned, 0);
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].message, "max reassignment count reached");
    assert_eq!(
        h.repo.task_status(&tenant(), task.task_ref.id),
        Some(TaskStatus::Failed)
    );
}

#[tokio::test]
async fn stale_worker_task_is_reassigned() {
    let h = Harness::new();
    h.register(WorkflowDefinition::new("job", ["run"]));
    let task = h.seed("job").await;
    h.repo
        .assign_task(
            &tenant(),
            task.task_ref.id,
            "w1",
            Utc::now() - chrono::Duration::seconds(120),
        )
        .unwrap();

    h.controller
        .process_task_reassignments(&tenant())
        .await
        .unwrap();

    let events = h.task_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, OlapEventType::Reassigned);
    assert_eq!(events[0].worker_id.as_deref(), Some("w1"));
    assert_eq!(
        h.repo.task_status(&tenant(), task.task_ref.id),
        Some(TaskStatus::Queued)
    );
}

#[tokio::test]
async fn queue_item_past_deadline_is_failed() {
    let h = Harness::new();
    h.register(WorkflowDefinition::new("job", ["run"]));
    let task = h.seed("job").await;
    h.repo
        .set_schedule_deadline(
            &tenant(),
            task.task_ref.id,
            Utc::now() - chrono::Duration::seconds(1),
        )
        .unwrap();

    h.controller.run_batched_queue_item_timeouts().await.unwrap();

    assert_eq!(
        h.repo.task_status(&tenant(), task.task_ref.id),
        Some(TaskStatus::Failed)
    );
    assert_eq!(h.transport.messages(&Queue::TaskProcessing).len(), 1);
}

#[tokio::test]
async fn idempotency_eviction_never_asks_to_continue() {
    let h = Harness::new();
    h.repo
        .insert_idempotency_key(&tenant(), "old", Utc::now() - chrono::Duration::seconds(1))
        .unwrap();

    let more = h.controller.evict_idempotency_keys(&tenant()).await.unwrap();
    assert!(!more);
    assert_eq!(h.repo.idempotency_key_count(&tenant()), 0);
}

#[tokio::test]
async fn exhausted_trigger_slots_shed_load() {
    let inner = Arc::new(InMemoryRepository::new());
    inner.add_tenant(Tenant::new(tenant()));
    inner
        .register_workflow(&tenant(), WorkflowDefinition::new("job", ["run"]))
        .unwrap();
    let gated = Arc::new(GatedRepository::new(inner));
    let ctx = ServiceContext::new(
        gated.clone(),
        Arc::new(InMemoryTransport::new()),
        ControllerConfig {
            trigger_slots: 2,
            ..ControllerConfig::default()
        },
    );
    let controller = TaskController::new(ctx);
    let trigger = || vec![WorkflowNameTrigger::new("job", json!({}))];

    let running: Vec<_> = (0..2)
        .map(|_| {
            let controller = controller.clone();
            let triggers = trigger();
            tokio::spawn(async move {
                controller
                    .trigger_writer()
                    .trigger_from_workflow_names(&tenant(), &triggers)
                    .await
            })
        })
        .collect();
    gated.wait_entered(2).await;
    assert_eq!(controller.trigger_writer().available_slots(), Some(0));

    let rejected = controller
        .trigger_writer()
        .trigger_from_workflow_names(&tenant(), &trigger())
        .await
        .unwrap_err();
    assert!(matches!(rejected, Error::NoTriggerSlots { capacity: 2 }));

    gated.release(2);
    for handle in running {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.tasks.len(), 1);
    }

    gated.release(1);
    let admitted = controller
        .trigger_writer()
        .trigger_from_workflow_names(&tenant(), &trigger())
        .await
        .unwrap();
    assert_eq!(admitted.tasks.len(), 1);
}

#[tokio::test]
async fn started_controller_consumes_and_shuts_down() {
    let h = Harness::new();
    h.register(WorkflowDefinition::new("job", ["run"]));
    let attempt = h.seed_running("job", "w1").await;

    let handle = h.controller.start().await.unwrap();
    assert_eq!(handle.pool_tenants(OperationKind::Timeout), vec![tenant()]);

    let payload = TaskCompletedPayload {
        task: attempt.clone(),
        output: json!({}),
    };
    h.transport
        .send(
            &Queue::TaskProcessing,
            vec![Message::single(tenant(), &payload).unwrap()],
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.repo.task_status(&tenant(), attempt.id) != Some(TaskStatus::Completed) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("consumer handled the completion");

    let token = handle.cancellation_token().clone();
    handle.shutdown().await.unwrap();
    assert!(token.is_cancelled());

    let completed = h
        .transport
        .payloads::<OlapRecord>(&Queue::Olap)
        .into_iter()
        .filter(|r| matches!(r, OlapRecord::TaskEvent(e) if e.event_type == OlapEventType::Completed))
        .count();
    assert_eq!(completed, 1);
}
