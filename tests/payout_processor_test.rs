//! Integration tests for the payout pipeline workers
//!
//! Tests cover:
//! - Synchronous settlement of a valid win
//! - Out-of-bounds amounts recorded and failed without a provider call
//! - Timeout retries with backoff and a single idempotency key
//! - The attempt cap
//! - Duplicate wins and duplicate jobs
//! - Orphan recovery and provider query reconciliation, rotating through
//!   batches with per-intent backoff
//! - Input limits of the ledger schema
//! - Operator retries

mod common;

use chrono::Duration;
use common::{Harness, ScriptedGateway, ScriptedSubmit, JOB_TIMEOUT};
use prize_payout::error::PayoutError;
use prize_payout::payouts::{AuditAction, AuditActor, PayoutIntent, PayoutLedger, PayoutStatus};
use prize_payout::providers::{QueryOutcome, SubmitOutcome};
use prize_payout::queue::{JobPriority, JobQueue, PayoutJob};
use prize_payout::services::{InitiatePayout, InitiatorConfig};
use prize_payout::workers::{JobOutcome, RetryScheduler, RetrySchedulerConfig};

fn transient(reason: &str) -> ScriptedSubmit {
    ScriptedSubmit::Respond(SubmitOutcome::TransientError {
        reason: reason.into(),
    })
}

/// Walk an intent to `FAILED` via a deterministic provider rejection.
async fn rejected_intent(h: &Harness, source_event_id: &str) -> PayoutIntent {
    h.gateway
        .script_submits([ScriptedSubmit::Respond(SubmitOutcome::Rejected {
            reason: "NAME_MISMATCH".into(),
        })]);
    let intent = h.win(source_event_id, "18.00").await.unwrap();
    assert_eq!(h.processor.drain().await.unwrap(), vec![JobOutcome::Failed]);
    h.intent(intent.id).await
}

#[tokio::test]
async fn test_valid_win_settles_synchronously() {
    let h = Harness::new();

    let intent = h.win("draw-2026-03-01-0001", "18.00").await.unwrap();
    assert_eq!(intent.status, PayoutStatus::Pending);
    assert_eq!(intent.attempt_count, 1);
    assert_eq!(h.queue_depth().await, 1);

    let outcomes = h.processor.drain().await.unwrap();
    assert_eq!(outcomes, vec![JobOutcome::Succeeded]);

    let done = h.intent(intent.id).await;
    assert_eq!(done.status, PayoutStatus::Succeeded);
    assert_eq!(
        done.provider_reference,
        Some(ScriptedGateway::settled_reference(&intent.idempotency_key))
    );
    assert!(done.completed_at.is_some());
    assert!(done.failure_reason.is_none());

    assert_eq!(
        h.actions(intent.id).await,
        vec![
            AuditAction::Created,
            AuditAction::SubmitStarted,
            AuditAction::TransferSucceeded,
        ]
    );
}

#[tokio::test]
async fn test_out_of_bounds_amount_is_recorded_and_failed() {
    let h = Harness::new();

    let err = h.win("draw-big", "250.00").await.unwrap_err();
    let PayoutError::InvalidAmount {
        reason, intent_id, ..
    } = err
    else {
        panic!("expected InvalidAmount, got {:?}", err);
    };
    assert!(reason.contains("[0.01, 200.00]"), "reason was {}", reason);

    let intent_id = intent_id.expect("rejected win is still recorded");
    let intent = h.intent(intent_id).await;
    assert_eq!(intent.status, PayoutStatus::Failed);
    assert!(intent.failure_reason.unwrap().contains("[0.01, 200.00]"));

    assert_eq!(h.queue_depth().await, 0);
    assert_eq!(h.gateway.submit_calls(), 0);
    assert_eq!(
        h.actions(intent_id).await,
        vec![AuditAction::Created, AuditAction::ValidationFailed]
    );
}

#[tokio::test]
async fn test_malformed_amounts_are_rejected_without_a_record() {
    let h = Harness::new();

    for value in ["0", "-5.00", "1.005"] {
        let err = h.win(&format!("draw-{}", value), value).await.unwrap_err();
        assert!(
            matches!(err, PayoutError::InvalidAmount { intent_id: None, .. }),
            "{} gave {:?}",
            value,
            err
        );
    }
    assert!(h.ledger.find_by_source_event("draw-0").await.unwrap().is_none());
}

#[tokio::test]
async fn test_timeouts_retry_with_backoff_under_one_idempotency_key() {
    // Given: the provider hangs twice, then settles
    let h = Harness::new();
    h.gateway
        .script_submits([ScriptedSubmit::Hang, ScriptedSubmit::Hang]);
    let intent = h.win("draw-flaky", "18.00").await.unwrap();

    // When: the first attempt times out
    assert_eq!(h.processor.drain().await.unwrap(), vec![JobOutcome::RetryScheduled]);
    let waiting = h.intent(intent.id).await;
    assert_eq!(waiting.status, PayoutStatus::AwaitingRetry);
    assert_eq!(waiting.attempt_count, 1);
    let first_delay = waiting.next_retry_at.unwrap() - waiting.updated_at;
    assert_eq!(first_delay, Duration::milliseconds(10_000));

    // Then: nothing is released before the delay elapses
    assert_eq!(h.scheduler.run_cycle().await.unwrap().released, 0);
    h.advance(Duration::milliseconds(9_999));
    assert_eq!(h.scheduler.run_cycle().await.unwrap().released, 0);

    h.advance(Duration::milliseconds(1));
    assert_eq!(h.scheduler.run_cycle().await.unwrap().released, 1);
    let released = h.intent(intent.id).await;
    assert_eq!(released.status, PayoutStatus::Pending);
    assert_eq!(released.attempt_count, 2);

    // Second attempt times out too, with a longer delay
    assert_eq!(h.processor.drain().await.unwrap(), vec![JobOutcome::RetryScheduled]);
    let waiting = h.intent(intent.id).await;
    let second_delay = waiting.next_retry_at.unwrap() - waiting.updated_at;
    assert_eq!(second_delay, Duration::milliseconds(20_000));
    assert!(second_delay > first_delay);

    h.advance(second_delay);
    assert_eq!(h.scheduler.run_cycle().await.unwrap().released, 1);
    assert_eq!(h.processor.drain().await.unwrap(), vec![JobOutcome::Succeeded]);

    let done = h.intent(intent.id).await;
    assert_eq!(done.status, PayoutStatus::Succeeded);
    assert_eq!(done.attempt_count, 3);

    let keys = h.gateway.submitted_keys();
    assert_eq!(keys.len(), 3);
    assert!(keys.iter().all(|k| *k == intent.idempotency_key));

    let actions = h.actions(intent.id).await;
    let count = |action| actions.iter().filter(|a| **a == action).count();
    assert_eq!(count(AuditAction::RetryScheduled), 2);
    assert_eq!(count(AuditAction::RetryReleased), 2);
    assert_eq!(count(AuditAction::TransferSucceeded), 1);
}

#[tokio::test]
async fn test_retry_cap_fails_permanently() {
    let h = Harness::new();
    h.gateway.script_submits([
        transient("HTTP 503"),
        transient("HTTP 503"),
        transient("HTTP 503"),
    ]);
    let intent = h.win("draw-doomed", "5.00").await.unwrap();

    assert_eq!(h.processor.drain().await.unwrap(), vec![JobOutcome::RetryScheduled]);
    h.advance(Duration::seconds(10));
    h.scheduler.run_cycle().await.unwrap();
    assert_eq!(h.processor.drain().await.unwrap(), vec![JobOutcome::RetryScheduled]);
    h.advance(Duration::seconds(20));
    h.scheduler.run_cycle().await.unwrap();
    assert_eq!(h.processor.drain().await.unwrap(), vec![JobOutcome::Failed]);

    let failed = h.intent(intent.id).await;
    assert_eq!(failed.status, PayoutStatus::Failed);
    assert_eq!(failed.attempt_count, failed.max_attempts);
    assert!(failed.failure_reason.unwrap().contains("retries exhausted"));

    // Never re-enqueued automatically
    h.advance(Duration::hours(2));
    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.released, 0);
    assert_eq!(report.orphans_requeued, 0);
    assert_eq!(h.queue_depth().await, 0);
    assert_eq!(h.gateway.submit_calls(), 3);
}

#[tokio::test]
async fn test_duplicate_source_event_returns_existing_intent() {
    let h = Harness::new();

    let first = h.win("draw-dup", "18.00").await.unwrap();
    let err = h.win("draw-dup", "18.00").await.unwrap_err();

    match err {
        PayoutError::DuplicateSourceEvent { intent_id, .. } => {
            assert_eq!(intent_id, Some(first.id))
        }
        other => panic!("expected DuplicateSourceEvent, got {:?}", other),
    }
    assert_eq!(h.queue_depth().await, 1);
    assert_eq!(h.initiator.get_status("draw-dup").await.unwrap().intent_id, first.id);
}

#[tokio::test]
async fn test_duplicate_job_never_calls_provider_twice() {
    let h = Harness::new();
    let intent = h.win("draw-twice", "18.00").await.unwrap();

    // A second delivery of the same job, e.g. after a worker crash
    h.queue
        .enqueue(PayoutJob::new(
            intent.id,
            JobPriority::NORMAL,
            intent.attempt_count,
            h.clock_now(),
        ))
        .await
        .unwrap();

    let outcomes = h.processor.drain().await.unwrap();
    assert_eq!(
        outcomes,
        vec![
            JobOutcome::Succeeded,
            JobOutcome::Skipped(PayoutStatus::Succeeded)
        ]
    );
    assert_eq!(h.gateway.submit_calls(), 1);
}

#[tokio::test]
async fn test_orphaned_pending_intent_is_requeued_once() {
    let h = Harness::new();

    // Recorded but never enqueued
    let orphan = PayoutIntent::new(
        "oUpF8uMuAJO_M2pxb1Q9zNjWeS6o".into(),
        "draw-orphan".into(),
        common::amount("3.00"),
        None,
        "PO0123456789abcdef0123456789abcd".into(),
        3,
        h.clock_now(),
    );
    h.ledger.insert(&orphan).await.unwrap();

    assert_eq!(h.scheduler.run_cycle().await.unwrap().orphans_requeued, 0);

    h.advance(Duration::seconds(121));
    assert_eq!(h.scheduler.run_cycle().await.unwrap().orphans_requeued, 1);
    assert_eq!(h.scheduler.run_cycle().await.unwrap().orphans_requeued, 0);
    assert_eq!(h.queue_depth().await, 1);

    assert_eq!(h.processor.drain().await.unwrap(), vec![JobOutcome::Succeeded]);
    assert_eq!(h.intent(orphan.id).await.status, PayoutStatus::Succeeded);
}

#[tokio::test]
async fn test_quiet_submission_is_reconciled_by_query() {
    let h = Harness::new();
    h.gateway
        .script_submits([ScriptedSubmit::Respond(SubmitOutcome::Accepted {
            reference: "1030000071100999991182020050700019480001".into(),
            settled: false,
        })]);
    h.gateway.script_queries([
        QueryOutcome::Processing,
        QueryOutcome::Succeeded {
            reference: "1030000071100999991182020050700019480001".into(),
        },
    ]);
    let intent = h.win("draw-quiet", "18.00").await.unwrap();

    assert_eq!(
        h.processor.drain().await.unwrap(),
        vec![JobOutcome::AwaitingConfirmation]
    );
    let submitted = h.intent(intent.id).await;
    assert_eq!(submitted.status, PayoutStatus::Submitted);
    assert_eq!(
        submitted.provider_reference.as_deref(),
        Some("1030000071100999991182020050700019480001")
    );

    // Not stale yet
    assert_eq!(h.scheduler.run_cycle().await.unwrap().reconciled, 0);

    h.advance(Duration::seconds(601));
    assert_eq!(h.scheduler.run_cycle().await.unwrap().reconciled, 0);
    assert_eq!(h.intent(intent.id).await.status, PayoutStatus::Submitted);

    // Still processing: not asked again until its next check is due
    assert_eq!(h.scheduler.run_cycle().await.unwrap().reconciled, 0);
    assert_eq!(h.gateway.queried_keys().len(), 1);

    h.advance(Duration::seconds(600));
    assert_eq!(h.scheduler.run_cycle().await.unwrap().reconciled, 1);
    let done = h.intent(intent.id).await;
    assert_eq!(done.status, PayoutStatus::Succeeded);

    let last = h.audit(intent.id).await.pop().unwrap();
    assert_eq!(last.action, AuditAction::QuerySucceeded);
    assert_eq!(last.actor, AuditActor::Scheduler);
}

fn single_item_scheduler(h: &Harness) -> RetryScheduler {
    RetryScheduler::new(
        h.machine.clone(),
        h.gateway.clone(),
        h.queue.clone(),
        RetrySchedulerConfig {
            batch_size: 1,
            query_timeout: JOB_TIMEOUT,
            ..RetrySchedulerConfig::default()
        },
    )
}

#[tokio::test]
async fn test_stale_submissions_rotate_through_batches() {
    // Given: two quiet submissions and a batch size of one
    let h = Harness::new();
    let scheduler = single_item_scheduler(&h);
    h.gateway.script_submits([
        ScriptedSubmit::Respond(SubmitOutcome::Accepted {
            reference: "BATCH-A".into(),
            settled: false,
        }),
        ScriptedSubmit::Respond(SubmitOutcome::Accepted {
            reference: "BATCH-B".into(),
            settled: false,
        }),
    ]);
    let a = h.win("draw-slow-a", "18.00").await.unwrap();
    h.processor.drain().await.unwrap();
    h.advance(Duration::seconds(1));
    let b = h.win("draw-slow-b", "18.00").await.unwrap();
    h.processor.drain().await.unwrap();

    h.gateway.script_queries([
        QueryOutcome::Processing,
        QueryOutcome::Succeeded {
            reference: "BATCH-B".into(),
        },
    ]);
    h.advance(Duration::seconds(601));
    let first_check = h.clock_now();

    // When: the scheduler runs repeatedly
    assert_eq!(scheduler.run_cycle().await.unwrap().reconciled, 0);
    assert_eq!(scheduler.run_cycle().await.unwrap().reconciled, 1);
    assert_eq!(scheduler.run_cycle().await.unwrap().reconciled, 0);

    // Then: the older intent no longer starves the newer one
    assert_eq!(
        h.gateway.queried_keys(),
        vec![a.idempotency_key.clone(), b.idempotency_key.clone()]
    );
    assert_eq!(h.intent(b.id).await.status, PayoutStatus::Succeeded);

    let waiting = h.intent(a.id).await;
    assert_eq!(waiting.status, PayoutStatus::Submitted);
    assert_eq!(waiting.check_count, 1);
    assert_eq!(waiting.next_check_at, Some(first_check + Duration::seconds(600)));

    // Repeated queries back off
    h.advance(Duration::seconds(600));
    assert_eq!(scheduler.run_cycle().await.unwrap().reconciled, 0);
    assert_eq!(h.gateway.queried_keys().len(), 3);
    let waiting = h.intent(a.id).await;
    assert_eq!(waiting.check_count, 2);
    assert_eq!(
        waiting.next_check_at,
        Some(h.clock_now() + Duration::seconds(1_200))
    );
}

#[tokio::test]
async fn test_orphans_rotate_through_batches() {
    let h = Harness::new();
    let scheduler = single_item_scheduler(&h);

    for (n, source) in ["draw-orphan-a", "draw-orphan-b"].iter().enumerate() {
        let orphan = PayoutIntent::new(
            "oUpF8uMuAJO_M2pxb1Q9zNjWeS6o".into(),
            source.to_string(),
            common::amount("3.00"),
            None,
            format!("PO0123456789abcdef0123456789abc{}", n),
            3,
            h.clock_now(),
        );
        h.ledger.insert(&orphan).await.unwrap();
        h.advance(Duration::seconds(1));
    }

    h.advance(Duration::seconds(121));
    assert_eq!(scheduler.run_cycle().await.unwrap().orphans_requeued, 1);
    assert_eq!(scheduler.run_cycle().await.unwrap().orphans_requeued, 1);
    assert_eq!(scheduler.run_cycle().await.unwrap().orphans_requeued, 0);
    assert_eq!(h.queue_depth().await, 2);

    assert_eq!(
        h.processor.drain().await.unwrap(),
        vec![JobOutcome::Succeeded, JobOutcome::Succeeded]
    );
}

#[tokio::test]
async fn test_status_lookup_trims_source_event_id() {
    let h = Harness::new();

    let intent = h.win("  draw-padded ", "18.00").await.unwrap();
    assert_eq!(intent.source_event_id, "draw-padded");

    let view = h.initiator.get_status(" draw-padded  ").await.unwrap();
    assert_eq!(view.intent_id, intent.id);
}

#[tokio::test]
async fn test_inputs_beyond_ledger_limits_are_rejected_without_a_record() {
    let h = Harness::new();
    let request = |source: String, amount: &str, memo: Option<String>| InitiatePayout {
        beneficiary_id: "oUpF8uMuAJO_M2pxb1Q9zNjWeS6o".into(),
        source_event_id: source,
        amount: common::amount(amount),
        memo,
    };

    let long_source = "d".repeat(65);
    let err = h
        .initiator
        .initiate(request(long_source.clone(), "18.00", None))
        .await
        .unwrap_err();
    assert!(matches!(err, PayoutError::Validation(_)), "{:?}", err);
    assert!(h.ledger.find_by_source_event(&long_source).await.unwrap().is_none());

    let err = h
        .initiator
        .initiate(request("draw-memo".into(), "18.00", Some("m".repeat(256))))
        .await
        .unwrap_err();
    assert!(matches!(err, PayoutError::Validation(_)), "{:?}", err);

    let err = h
        .initiator
        .initiate(request("draw-huge".into(), "1e15", None))
        .await
        .unwrap_err();
    assert!(
        matches!(err, PayoutError::InvalidAmount { intent_id: None, .. }),
        "{:?}",
        err
    );
    assert!(h.ledger.find_by_source_event("draw-huge").await.unwrap().is_none());

    // At the limit is fine
    let ok = h
        .initiator
        .initiate(request("d".repeat(64), "18.00", Some("m".repeat(255))))
        .await
        .unwrap();
    assert_eq!(ok.status, PayoutStatus::Pending);
    h.processor.drain().await.unwrap();

    let failed = rejected_intent(&h, "draw-operator").await;
    let err = h.initiator.retry(failed.id, &"o".repeat(56)).await.unwrap_err();
    assert!(matches!(err, PayoutError::Validation(_)), "{:?}", err);
}

#[tokio::test]
async fn test_closed_transfer_found_by_query_is_retried() {
    let h = Harness::new();
    h.gateway
        .script_submits([ScriptedSubmit::Respond(SubmitOutcome::Accepted {
            reference: "BATCH-77".into(),
            settled: false,
        })]);
    h.gateway.script_queries([QueryOutcome::Failed {
        reference: Some("BATCH-77".into()),
        reason: "MERCHANT_REJECT".into(),
    }]);
    let intent = h.win("draw-closed", "18.00").await.unwrap();
    h.processor.drain().await.unwrap();

    h.advance(Duration::seconds(601));
    assert_eq!(h.scheduler.run_cycle().await.unwrap().reconciled, 1);

    let waiting = h.intent(intent.id).await;
    assert_eq!(waiting.status, PayoutStatus::AwaitingRetry);
    assert!(waiting.failure_reason.unwrap().contains("MERCHANT_REJECT"));
}

#[tokio::test]
async fn test_manual_retry_of_failed_payout() {
    let h = Harness::new();
    let failed = rejected_intent(&h, "draw-manual").await;
    assert_eq!(failed.status, PayoutStatus::Failed);

    let reopened = h.initiator.retry(failed.id, "ops-alice").await.unwrap();
    assert_eq!(reopened.status, PayoutStatus::Pending);
    assert_eq!(reopened.attempt_count, 2);
    assert!(reopened.failure_reason.is_none());
    assert!(reopened.completed_at.is_none());

    let last = h.audit(failed.id).await.pop().unwrap();
    assert_eq!(last.action, AuditAction::ManualRetry);
    assert_eq!(last.actor, AuditActor::Operator("ops-alice".into()));
    assert_eq!(last.status_before, Some(PayoutStatus::Failed));

    assert_eq!(h.processor.drain().await.unwrap(), vec![JobOutcome::Succeeded]);
    assert_eq!(h.gateway.submitted_keys()[0], h.gateway.submitted_keys()[1]);
}

#[tokio::test]
async fn test_manual_retry_rejected_outside_failed() {
    let h = Harness::new();
    let intent = h.win("draw-paid", "18.00").await.unwrap();
    h.processor.drain().await.unwrap();

    let err = h.initiator.retry(intent.id, "ops-alice").await.unwrap_err();
    assert!(matches!(err, PayoutError::RetryRejected { .. }));
    assert_eq!(h.intent(intent.id).await.status, PayoutStatus::Succeeded);
}

#[tokio::test]
async fn test_manual_retry_after_cap_depends_on_reset_policy() {
    let reject = || {
        ScriptedSubmit::Respond(SubmitOutcome::Rejected {
            reason: "NAME_MISMATCH".into(),
        })
    };

    // Given: a payout that keeps failing until its attempts are used up
    let strict = Harness::new();
    let failed = rejected_intent(&strict, "draw-cap").await;
    for _ in 0..2 {
        strict.gateway.script_submits([reject()]);
        strict.initiator.retry(failed.id, "ops-bob").await.unwrap();
        assert_eq!(strict.processor.drain().await.unwrap(), vec![JobOutcome::Failed]);
    }
    let exhausted = strict.intent(failed.id).await;
    assert_eq!(exhausted.attempt_count, 3);
    assert!(exhausted.retries_exhausted());

    // Then: without attempt reset the operator cannot reopen it
    let err = strict.initiator.retry(failed.id, "ops-bob").await.unwrap_err();
    assert!(matches!(err, PayoutError::RetryRejected { .. }));
    assert_eq!(strict.queue_depth().await, 0);

    // With attempt reset the counter starts over
    let lenient = Harness::with_initiator_config(InitiatorConfig {
        allow_manual_attempt_reset: true,
        ..InitiatorConfig::default()
    });
    let failed = rejected_intent(&lenient, "draw-cap").await;
    let reopened = lenient.initiator.retry(failed.id, "ops-bob").await.unwrap();
    assert_eq!(reopened.attempt_count, 1);
    assert_eq!(lenient.queue_depth().await, 1);
}
