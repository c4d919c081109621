//! End-to-end tests over the in-memory backend: the full lifecycle
//! from enqueue through claim, execution, retry, uniqueness, stale
//! recovery, and shutdown.

use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quarry_core::{
    Backend, Engine, EngineConfig, ExponentialBackoff, Job, JobId, JobState, JobUpdate,
    MemoryBackend, NewJob, Outcome, QueueSpec, QueueUpdate, RunError, SharedBackend,
    UniquenessConfig,
};

fn fast_config() -> EngineConfig {
    EngineConfig::new()
        .queue("q")
        .poll_interval(Duration::from_millis(10))
        .reaper_interval(Duration::from_secs(60))
        .backoff(ExponentialBackoff::fixed(Duration::from_millis(1)))
        .shutdown_timeout(Duration::from_secs(5))
}

/// Poll until the condition holds or five seconds pass.
async fn wait_until<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn fetch(backend: &SharedBackend, id: JobId) -> Job {
    backend.get_job(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_job_runs_to_completion() {
    let engine = Engine::new(MemoryBackend::new(), fast_config()).await.unwrap();
    engine.registry().register_handler("double", |_ctx, args| async move {
        let n = args[0].as_i64().unwrap_or(0);
        Ok(Outcome::Complete(json!(n * 2)))
    });
    engine.start().await.unwrap();

    let backend = engine.backend();
    let job = engine
        .enqueue(NewJob::new("q", "double").arg(json!(21)))
        .await
        .unwrap();

    assert!(
        wait_until(|| async { fetch(&backend, job.id).await.state == JobState::Completed }).await
    );
    let done = fetch(&backend, job.id).await;
    assert_eq!(done.result, Some(json!(42)));
    assert_eq!(done.attempt, 1);
    assert!(done.completed_at.is_some());
    assert!(done.claimed_by.is_none());
    assert!(done.errors.is_empty());

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_failing_job_exhausts_attempts() {
    let engine = Engine::new(MemoryBackend::new(), fast_config()).await.unwrap();
    engine.registry().register_handler("boom", |_ctx, _args| async {
        Err(RunError::new("BoomError", "always fails"))
    });
    engine.start().await.unwrap();

    let backend = engine.backend();
    let job = engine
        .enqueue(NewJob::new("q", "boom").max_attempts(3))
        .await
        .unwrap();

    assert!(wait_until(|| async { fetch(&backend, job.id).await.state == JobState::Failed }).await);
    let failed = fetch(&backend, job.id).await;
    assert_eq!(failed.attempt, 3);
    assert_eq!(failed.errors.len(), 3);
    assert!(failed.errors.iter().all(|e| e.name == "BoomError"));
    assert_eq!(
        failed.errors.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(failed.failed_at.is_some());

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_claims_never_overlap() {
    let backend = SharedBackend::new(MemoryBackend::new());
    let job = backend.create_job(NewJob::new("q", "c")).await.unwrap();

    let (a, b) = tokio::join!(
        backend.claim_pending("q", 1, "worker-a"),
        backend.claim_pending("q", 1, "worker-b"),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.len() + b.len(), 1);
    let claimed = a.into_iter().chain(b).next().unwrap();
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.state, JobState::Claimed);
}

#[tokio::test]
async fn test_many_workers_partition_the_waiting_set() {
    let backend = SharedBackend::new(MemoryBackend::new());
    for _ in 0..40 {
        backend.create_job(NewJob::new("q", "c")).await.unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = backend
                    .claim_pending("q", 3, &format!("worker-{w}"))
                    .await
                    .unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|j| j.id.0));
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort_unstable();
    let before = all.len();
    all.dedup();
    assert_eq!(before, 40, "every job claimed exactly once");
    assert_eq!(all.len(), 40);
}

#[tokio::test]
async fn test_uniqueness_window_spans_active_states() {
    let engine = Engine::new(MemoryBackend::new(), fast_config()).await.unwrap();
    let gate = Arc::new(tokio::sync::Notify::new());
    let release = gate.clone();
    engine.registry().register_handler("unique", move |_ctx, _args| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            Ok(Outcome::Complete(json!(null)))
        }
    });
    engine.start().await.unwrap();

    let backend = engine.backend();
    let new = || NewJob::new("q", "unique").unique(UniquenessConfig::by_key("X"));

    let first = engine.enqueue(new()).await.unwrap();
    assert!(first.unique_digest.is_some());

    // Still active (waiting, claimed, or running): duplicate rejected.
    let err = engine.enqueue(new()).await.unwrap_err();
    assert!(matches!(err, quarry_core::QuarryError::DuplicateJob { .. }));

    assert!(
        wait_until(|| async { fetch(&backend, first.id).await.state == JobState::Running }).await
    );
    release.notify_waiters();
    assert!(
        wait_until(|| async { fetch(&backend, first.id).await.state == JobState::Completed }).await
    );

    // Terminal completion released the digest. Pause the queue first
    // so the re-enqueued job stays waiting.
    backend.update_queue(QueueUpdate::pause("q")).await.unwrap();
    assert!(fetch(&backend, first.id).await.unique_digest.is_none());
    let third = engine.enqueue(new()).await.unwrap();
    assert_ne!(third.id, first.id);

    engine.cancel(third.id).await.unwrap();
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_snooze_consumes_no_attempt() {
    let engine = Engine::new(MemoryBackend::new(), fast_config()).await.unwrap();
    engine.registry().register_handler("later", |_ctx, _args| async {
        Ok(Outcome::Snooze(Duration::from_secs(10)))
    });
    engine.start().await.unwrap();

    let backend = engine.backend();
    let before = quarry_core::now_ms();
    let job = engine.enqueue(NewJob::new("q", "later")).await.unwrap();

    assert!(
        wait_until(|| async {
            let j = fetch(&backend, job.id).await;
            j.state == JobState::Waiting && j.available_at > before
        })
        .await
    );
    let snoozed = fetch(&backend, job.id).await;
    assert_eq!(snoozed.attempt, 0);
    assert!(snoozed.errors.is_empty());
    assert!(snoozed.available_at >= before + 10_000);
    assert!(snoozed.claimed_by.is_none());

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_reaper_rescues_job_stranded_by_dead_worker() {
    let backend = SharedBackend::new(MemoryBackend::new());
    let config = fast_config()
        .reaper_interval(Duration::from_millis(50))
        .max_claimed(Duration::ZERO);
    let engine = Engine::with_shared(backend.clone(), config).await.unwrap();
    engine.registry().register_handler("c", |_ctx, _args| async {
        Ok(Outcome::Complete(json!("recovered")))
    });

    // Strand a claim before any pool is running.
    let job = engine.enqueue(NewJob::new("q", "c")).await.unwrap();
    let claimed = backend.claim_pending("q", 1, "dead-worker").await.unwrap();
    assert_eq!(claimed.len(), 1);

    engine.start().await.unwrap();
    assert!(
        wait_until(|| async { fetch(&backend, job.id).await.state == JobState::Completed }).await
    );

    let done = fetch(&backend, job.id).await;
    // One consumed attempt for the stranded claim, one for the rerun.
    assert_eq!(done.attempt, 2);
    assert_eq!(done.errors.len(), 1);
    assert_eq!(done.errors[0].name, "StaleJob");
    assert_eq!(done.result, Some(json!("recovered")));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_delete_finished_jobs_respects_cutoff() {
    let backend = SharedBackend::new(MemoryBackend::new());

    let mut old_ids = Vec::new();
    for _ in 0..3 {
        let job = backend.create_job(NewJob::new("q", "c")).await.unwrap();
        backend.claim_pending("q", 1, "w").await.unwrap();
        backend
            .update_job(JobUpdate::completed(job.id, json!(null), 1))
            .await
            .unwrap();
        old_ids.push(job.id);
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    let cutoff = quarry_core::now_ms();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut new_ids = Vec::new();
    for _ in 0..2 {
        let job = backend.create_job(NewJob::new("q", "c")).await.unwrap();
        backend.claim_pending("q", 1, "w").await.unwrap();
        backend
            .update_job(JobUpdate::completed(job.id, json!(null), 1))
            .await
            .unwrap();
        new_ids.push(job.id);
    }
    let waiting = backend.create_job(NewJob::new("q", "c")).await.unwrap();

    let removed = backend.delete_finished_jobs(cutoff).await.unwrap();
    assert_eq!(removed, 3);
    for id in old_ids {
        assert!(backend.get_job(id).await.unwrap().is_none());
    }
    for id in new_ids {
        assert!(backend.get_job(id).await.unwrap().is_some());
    }
    assert!(backend.get_job(waiting.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_queue_concurrency_is_respected() {
    let config = EngineConfig::new()
        .queue_spec(QueueSpec::new("q").concurrency(1))
        .poll_interval(Duration::from_millis(10))
        .backoff(ExponentialBackoff::fixed(Duration::from_millis(1)));
    let engine = Engine::new(MemoryBackend::new(), config).await.unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak.clone());
    engine.registry().register_handler("slow", move |_ctx, _args| {
        let (active, peak) = (a.clone(), p.clone());
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(Outcome::Complete(json!(null)))
        }
    });
    engine.start().await.unwrap();

    let backend = engine.backend();
    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(engine.enqueue(NewJob::new("q", "slow")).await.unwrap().id);
    }

    assert!(
        wait_until(|| async {
            for id in &ids {
                if fetch(&backend, *id).await.state != JobState::Completed {
                    return false;
                }
            }
            true
        })
        .await
    );
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_paused_queue_holds_jobs() {
    let engine = Engine::new(MemoryBackend::new(), fast_config()).await.unwrap();
    engine.registry().register_handler("c", |_ctx, _args| async {
        Ok(Outcome::Complete(json!(null)))
    });
    engine.start().await.unwrap();

    let backend = engine.backend();
    backend.update_queue(QueueUpdate::pause("q")).await.unwrap();
    let job = engine.enqueue(NewJob::new("q", "c")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fetch(&backend, job.id).await.state, JobState::Waiting);

    backend.update_queue(QueueUpdate::resume("q")).await.unwrap();
    assert!(
        wait_until(|| async { fetch(&backend, job.id).await.state == JobState::Completed }).await
    );

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_delayed_job_waits_for_availability() {
    let engine = Engine::new(MemoryBackend::new(), fast_config()).await.unwrap();
    engine.registry().register_handler("c", |_ctx, _args| async {
        Ok(Outcome::Complete(json!(null)))
    });
    engine.start().await.unwrap();

    let backend = engine.backend();
    let job = engine
        .enqueue(NewJob::new("q", "c").available_in(Duration::from_millis(150)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fetch(&backend, job.id).await.state, JobState::Waiting);

    assert!(
        wait_until(|| async { fetch(&backend, job.id).await.state == JobState::Completed }).await
    );

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_running_job_is_cooperative_and_final() {
    let engine = Engine::new(MemoryBackend::new(), fast_config()).await.unwrap();
    engine.registry().register_handler("loop", |ctx, _args| async move {
        loop {
            if ctx.is_cancelled() {
                return Ok(Outcome::Complete(json!("bailed")));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    engine.start().await.unwrap();

    let backend = engine.backend();
    let job = engine.enqueue(NewJob::new("q", "loop")).await.unwrap();
    assert!(
        wait_until(|| async { fetch(&backend, job.id).await.state == JobState::Running }).await
    );

    let canceled = engine.cancel(job.id).await.unwrap();
    assert_eq!(canceled.state, JobState::Canceled);

    // The handler bails out and reports completion, but the terminal
    // row stays canceled.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = fetch(&backend, job.id).await;
    assert_eq!(after.state, JobState::Canceled);
    assert!(after.result.is_none());

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_timeout_failure_is_retried() {
    let engine = Engine::new(MemoryBackend::new(), fast_config()).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    engine.registry().register_handler("slowpoke", move |_ctx, _args| {
        let calls = counter.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                // First attempt overruns its timeout.
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok(Outcome::Complete(json!(null)))
        }
    });
    engine.start().await.unwrap();

    let backend = engine.backend();
    let job = engine
        .enqueue(
            NewJob::new("q", "slowpoke")
                .timeout(Duration::from_millis(50))
                .max_attempts(2),
        )
        .await
        .unwrap();

    assert!(
        wait_until(|| async { fetch(&backend, job.id).await.state == JobState::Completed }).await
    );
    let done = fetch(&backend, job.id).await;
    assert_eq!(done.attempt, 2);
    assert_eq!(done.errors.len(), 1);
    assert_eq!(done.errors[0].name, "TimeoutError");

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_recurring_schedule_fires_and_stops() {
    let engine = Engine::new(
        MemoryBackend::new(),
        fast_config().queue("cron"),
    )
    .await
    .unwrap();
    engine.registry().register_handler("tick", |_ctx, _args| async {
        Ok(Outcome::Complete(json!(null)))
    });
    engine.start().await.unwrap();

    let backend = engine.backend();
    // Every second.
    let id = engine
        .schedule("* * * * * * *", || NewJob::new("cron", "tick"))
        .unwrap();

    assert!(
        wait_until(|| async {
            let counts = backend
                .count_jobs(&quarry_core::TimeRange::all())
                .await
                .unwrap();
            counts.completed >= 1
        })
        .await
    );

    assert!(engine.unschedule(id));
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_drains_in_flight_work() {
    let engine = Engine::new(MemoryBackend::new(), fast_config()).await.unwrap();
    engine.registry().register_handler("slow", |_ctx, _args| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Outcome::Complete(json!("drained")))
    });
    engine.start().await.unwrap();

    let backend = engine.backend();
    let job = engine.enqueue(NewJob::new("q", "slow")).await.unwrap();
    assert!(
        wait_until(|| async { fetch(&backend, job.id).await.state == JobState::Running }).await
    );

    engine.close().await.unwrap();
    assert!(!engine.is_running());

    let done = fetch(&backend, job.id).await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.result, Some(json!("drained")));
}
