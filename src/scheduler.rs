//! Claim loop: the crash-safe scheduler.
//!
//! Single-threaded cooperative loop, safe to run as multiple replicas: due
//! schedules are acquired through the store's row-locked claim with a TTL,
//! so a crashed claimant's rows free up on their own and no schedule is
//! ever dispatched twice concurrently. Per claimed schedule the loop gates
//! on concurrency caps, resolves (or creates) the attached run, routes it
//! to a host, hands it to the executor, and recomputes recurrence.
//!
//! Errors are recorded on the ScheduledRun; a tick never propagates one.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::SchedulerConfig;
use crate::error::OrchestratorError;
use crate::hosts::HostRouter;
use crate::model::{
    ApprovalStatus, DirectiveSnapshot, Run, RunStatus, Schedule, ScheduledRun, ScheduledRunStatus,
    WorkerHost,
};
use crate::store::{NewRun, Store};

/// Seam between the claim loop and the worker dispatcher. The production
/// implementation is [`crate::dispatch::WorkerDispatcher`].
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute_run(
        &self,
        run: &Run,
        host: &WorkerHost,
    ) -> Result<RunStatus, OrchestratorError>;
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    router: HostRouter,
    executor: Arc<dyn RunExecutor>,
    config: SchedulerConfig,
    claimant: String,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        router: HostRouter,
        executor: Arc<dyn RunExecutor>,
        config: SchedulerConfig,
        claimant: String,
    ) -> Self {
        Self {
            store,
            router,
            executor,
            config,
            claimant,
        }
    }

    /// Run ticks forever at the configured poll period.
    pub async fn run_forever(&self) {
        tracing::info!(
            claimant = %self.claimant,
            interval_secs = self.config.interval.as_secs(),
            "scheduler loop starting"
        );
        loop {
            let dispatched = self.tick().await;
            if dispatched > 0 {
                tracing::info!(dispatched, "scheduler tick complete");
            }
            tokio::time::sleep(self.config.interval).await;
        }
    }

    /// One tick: claim due schedules and process each. Returns how many
    /// dispatches were attempted.
    pub async fn tick(&self) -> usize {
        let now = Utc::now();
        let claimed = match self
            .store
            .claim_due_schedules(
                now,
                &self.claimant,
                self.config.claim_ttl,
                self.config.claim_batch,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(error = %e, "claim query failed");
                return 0;
            }
        };

        let mut dispatched = 0;
        for schedule in claimed {
            let schedule_id = schedule.id;
            match self.process_schedule(schedule, now).await {
                Ok(did_dispatch) => {
                    if did_dispatch {
                        dispatched += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(schedule_id = %schedule_id, error = %e, "schedule processing failed");
                }
            }
            if let Err(e) = self.store.release_schedule_claim(schedule_id).await {
                tracing::error!(schedule_id = %schedule_id, error = %e, "failed to release claim");
            }
        }
        dispatched
    }

    async fn process_schedule(
        &self,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        // Concurrency gate first: a capped schedule backs off without
        // resolving or creating anything.
        if !self.concurrency_gates_pass(&schedule).await? {
            tracing::info!(schedule = %schedule.name, "concurrency cap hit, deferring");
            self.store
                .defer_schedule(schedule.id, now + to_chrono(self.config.gate_backoff))
                .await?;
            return Ok(false);
        }

        let (scheduled_run, run) = self.resolve_run(&schedule, now).await?;

        // Operator cancelled before dispatch: record and move on.
        if run.status == RunStatus::Cancelled {
            self.store
                .finish_scheduled_run(
                    scheduled_run.id,
                    ScheduledRunStatus::Finished,
                    now,
                    "cancelled before dispatch",
                )
                .await?;
            self.advance_recurrence(&schedule, now).await?;
            return Ok(false);
        }
        if run.status.is_terminal() {
            self.store
                .finish_scheduled_run(
                    scheduled_run.id,
                    ScheduledRunStatus::Finished,
                    now,
                    "run already terminal",
                )
                .await?;
            self.advance_recurrence(&schedule, now).await?;
            return Ok(false);
        }

        // Approval gate: pending approvals retry later, denials end the run.
        match run.approval {
            ApprovalStatus::Pending => {
                tracing::info!(run_id = %run.id, "run awaiting approval, deferring");
                self.store
                    .defer_schedule(schedule.id, now + to_chrono(self.config.gate_backoff))
                    .await?;
                return Ok(false);
            }
            ApprovalStatus::Denied => {
                self.store.cancel_run(run.id, now).await?;
                self.store
                    .finish_scheduled_run(
                        scheduled_run.id,
                        ScheduledRunStatus::Finished,
                        now,
                        "approval denied",
                    )
                    .await?;
                self.advance_recurrence(&schedule, now).await?;
                return Ok(false);
            }
            ApprovalStatus::None | ApprovalStatus::Approved => {}
        }

        // Host routing. Failure is recorded, never thrown.
        let requires_gpu = self.run_requires_gpu(&run).await;
        let host = match self
            .router
            .select_host(run.worker_host_id, requires_gpu)
            .await
        {
            Ok(host) => host,
            Err(err) => {
                tracing::warn!(run_id = %run.id, error = %err, "no eligible host");
                self.store
                    .finish_run(
                        run.id,
                        RunStatus::Failed,
                        now,
                        "",
                        &serde_json::json!({}),
                        &err.to_string(),
                    )
                    .await?;
                self.store
                    .finish_scheduled_run(
                        scheduled_run.id,
                        ScheduledRunStatus::Failed,
                        now,
                        err.kind(),
                    )
                    .await?;
                self.advance_recurrence(&schedule, now).await?;
                return Ok(false);
            }
        };

        self.store.set_run_host(run.id, host.id).await?;
        self.store
            .mark_scheduled_run_started(scheduled_run.id, now)
            .await?;

        if !self.store.mark_run_running(run.id, now).await? {
            // Lost a race with cancellation between resolve and here.
            self.router.release(host.id).await?;
            self.store
                .finish_scheduled_run(
                    scheduled_run.id,
                    ScheduledRunStatus::Finished,
                    now,
                    "run no longer pending",
                )
                .await?;
            self.advance_recurrence(&schedule, now).await?;
            return Ok(false);
        }

        // Recurrence advances before the (potentially long) dispatch; the
        // claim protects this schedule for the duration either way.
        self.advance_recurrence(&schedule, now).await?;

        let run = self.store.get_run(run.id).await?.unwrap_or(run);
        let outcome = self.executor.execute_run(&run, &host).await;
        self.router.release(host.id).await?;

        match outcome {
            Ok(RunStatus::Failed) => {
                let error = self
                    .store
                    .get_run(run.id)
                    .await?
                    .map(|r| r.error_message)
                    .unwrap_or_default();
                self.store
                    .finish_scheduled_run(scheduled_run.id, ScheduledRunStatus::Failed, Utc::now(), &error)
                    .await?;
            }
            Ok(RunStatus::Cancelled) => {
                self.store
                    .finish_scheduled_run(
                        scheduled_run.id,
                        ScheduledRunStatus::Finished,
                        Utc::now(),
                        "cancelled during dispatch",
                    )
                    .await?;
            }
            Ok(_) => {
                self.store
                    .finish_scheduled_run(
                        scheduled_run.id,
                        ScheduledRunStatus::Finished,
                        Utc::now(),
                        "",
                    )
                    .await?;
            }
            Err(err) => {
                tracing::error!(run_id = %run.id, error = %err, "dispatch failed");
                // Make sure the run reaches a terminal state.
                self.store
                    .finish_run(
                        run.id,
                        RunStatus::Failed,
                        Utc::now(),
                        "",
                        &serde_json::json!({}),
                        &err.to_string(),
                    )
                    .await?;
                self.store
                    .finish_scheduled_run(
                        scheduled_run.id,
                        ScheduledRunStatus::Failed,
                        Utc::now(),
                        err.kind(),
                    )
                    .await?;
            }
        }
        Ok(true)
    }

    /// Find the run for a claimed schedule: the pending binding from a
    /// one-shot launch, or a freshly created run for a recurring schedule.
    async fn resolve_run(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<(ScheduledRun, Run), OrchestratorError> {
        if let Some(scheduled_run) = self.store.pending_scheduled_run(schedule.id).await? {
            let run = self
                .store
                .get_run(scheduled_run.run_id)
                .await?
                .ok_or(OrchestratorError::RunNotFound {
                    id: scheduled_run.run_id,
                })?;
            return Ok((scheduled_run, run));
        }

        let (directive_id, snapshot) = self.resolve_directive(schedule, now).await?;
        let approval = if snapshot.approval_required {
            ApprovalStatus::Pending
        } else {
            ApprovalStatus::None
        };
        let (run, _jobs) = self
            .store
            .create_run_with_jobs(NewRun {
                directive_id,
                snapshot,
                approval,
                worker_host_id: None,
                tasks: vec![schedule.task_kind],
            })
            .await?;
        let scheduled_run = self
            .store
            .create_scheduled_run(schedule.id, run.id, ScheduledRunStatus::Pending)
            .await?;
        Ok((scheduled_run, run))
    }

    async fn resolve_directive(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<(Option<uuid::Uuid>, DirectiveSnapshot), OrchestratorError> {
        if let Some(id) = schedule.directive_id {
            if let Some(directive) = self.store.get_directive(id).await? {
                return Ok((Some(id), DirectiveSnapshot::from_directive(&directive, now)));
            }
            tracing::warn!(schedule = %schedule.name, "schedule directive vanished, using inline text");
        }
        Ok((
            None,
            DirectiveSnapshot::custom(&schedule.custom_directive_text, now),
        ))
    }

    async fn concurrency_gates_pass(&self, schedule: &Schedule) -> Result<bool, OrchestratorError> {
        if let Some(max_global) = schedule.max_global {
            if self.store.count_running_runs().await? >= i64::from(max_global) {
                return Ok(false);
            }
        }
        if let Some(max_per_job) = schedule.max_per_job {
            if self
                .store
                .count_running_runs_of_kind(schedule.task_kind)
                .await?
                >= i64::from(max_per_job)
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn run_requires_gpu(&self, run: &Run) -> bool {
        let Ok(jobs) = self.store.list_jobs(run.id).await else {
            return false;
        };
        for job in jobs {
            let (name, tag) = run.directive_snapshot.image_for(job.kind);
            if let Ok(Some(image)) = self.store.find_worker_image(&name, &tag).await {
                if image.requires_gpu {
                    return true;
                }
            }
        }
        false
    }

    async fn advance_recurrence(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let next = compute_next_run(schedule, now);
        self.store
            .record_schedule_run(schedule.id, now, next)
            .await?;
        Ok(())
    }
}

/// Next fire time for a schedule. One-shot schedules are pushed to the far
/// future ("never again"); a schedule whose cron expression no longer
/// parses stops firing.
pub fn compute_next_run(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if schedule.is_one_shot() {
        return Some(now + chrono::Duration::days(36_500));
    }
    match schedule.kind {
        crate::model::ScheduleKind::Interval => schedule
            .interval_minutes
            .filter(|m| *m > 0)
            .map(|m| now + chrono::Duration::minutes(m)),
        crate::model::ScheduleKind::Cron => {
            let expr = schedule.cron_expr.as_deref()?;
            let parsed = match cron::Schedule::from_str(expr) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(schedule = %schedule.name, error = %e, "invalid cron expression");
                    return None;
                }
            };
            let tz: chrono_tz::Tz = schedule
                .timezone
                .parse()
                .unwrap_or(chrono_tz::UTC);
            parsed
                .after(&now.with_timezone(&tz))
                .next()
                .map(|t| t.with_timezone(&Utc))
        }
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::seconds(60))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::model::{HostCapabilities, HostKind, JobStatus, ScheduleKind, TaskKind, TaskScope};
    use crate::store::{MemStore, NewSchedule, NewWorkerHost};

    /// Executor that finishes every job successfully without Docker.
    struct StubExecutor {
        calls: AtomicUsize,
        outcome: RunStatus,
    }

    impl StubExecutor {
        fn succeeding() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: RunStatus::Success,
            }
        }
    }

    #[async_trait]
    impl RunExecutor for StubExecutor {
        async fn execute_run(
            &self,
            _run: &Run,
            _host: &WorkerHost,
        ) -> Result<RunStatus, OrchestratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome)
        }
    }

    struct RecordingExecutor {
        store: Arc<MemStore>,
    }

    #[async_trait]
    impl RunExecutor for RecordingExecutor {
        async fn execute_run(
            &self,
            run: &Run,
            _host: &WorkerHost,
        ) -> Result<RunStatus, OrchestratorError> {
            let now = Utc::now();
            for job in self.store.list_jobs(run.id).await? {
                self.store.mark_job_running(job.id, now).await?;
                self.store
                    .finish_job(job.id, JobStatus::Success, now, &serde_json::json!({}), "")
                    .await?;
            }
            self.store
                .finish_run(
                    run.id,
                    RunStatus::Success,
                    now,
                    "# report",
                    &serde_json::json!({}),
                    "",
                )
                .await?;
            Ok(RunStatus::Success)
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(30),
            claim_ttl: Duration::from_secs(120),
            claim_batch: 10,
            gate_backoff: Duration::from_secs(60),
            job_timeout: Duration::from_secs(600),
        }
    }

    async fn seed_healthy_host(store: &MemStore) -> WorkerHost {
        let host = store
            .create_host(NewWorkerHost {
                name: "h0".into(),
                kind: HostKind::LocalSocket,
                endpoint: "unix:///var/run/docker.sock".into(),
                capabilities: HostCapabilities {
                    max_concurrency: 5,
                    ..Default::default()
                },
                ssh: None,
                enabled: true,
            })
            .await
            .unwrap();
        store
            .set_host_health(host.id, true, Some(Utc::now()))
            .await
            .unwrap();
        host
    }

    fn scheduler(store: Arc<MemStore>, executor: Arc<dyn RunExecutor>) -> Scheduler {
        Scheduler::new(
            store.clone(),
            HostRouter::new(store, Duration::from_secs(300)),
            executor,
            config(),
            "test-scheduler:1".to_string(),
        )
    }

    fn recurring(name: &str, minutes: i64, max_global: Option<i32>) -> NewSchedule {
        NewSchedule {
            name: name.to_string(),
            task_kind: TaskKind::LogTriage,
            directive_id: None,
            custom_directive_text: "recurring sweep".to_string(),
            enabled: true,
            kind: ScheduleKind::Interval,
            interval_minutes: Some(minutes),
            cron_expr: None,
            timezone: "UTC".to_string(),
            task3_scope: TaskScope::Allowlist,
            max_global,
            max_per_job: None,
            next_run_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        }
    }

    #[tokio::test]
    async fn dispatches_one_shot_launch_without_duplicating_the_run() {
        let store = Arc::new(MemStore::new());
        seed_healthy_host(&store).await;
        let launcher = crate::launcher::RunLauncher::new(store.clone());
        let directive = store
            .create_directive(crate::store::NewDirective {
                name: "d0".into(),
                description: String::new(),
                task_config: serde_json::json!({}),
                directive_text: String::new(),
                task_list: vec![TaskKind::LogTriage],
                approval_required: false,
                max_concurrent_runs: 5,
                enabled: true,
            })
            .await
            .unwrap();
        let run = launcher
            .launch(crate::launcher::LaunchRequest {
                directive_id: Some(directive.id),
                ..Default::default()
            })
            .await
            .unwrap();

        let executor = Arc::new(RecordingExecutor {
            store: store.clone(),
        });
        let sched = scheduler(store.clone(), executor);
        assert_eq!(sched.tick().await, 1);

        // The pre-created run executed; no second run appeared.
        let runs = store.list_runs(Default::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run.id);
        assert_eq!(runs[0].status, RunStatus::Success);

        // The one-shot schedule won't fire again.
        let schedules = store.list_schedules().await.unwrap();
        let next = schedules[0].next_run_at.unwrap();
        assert!(next > Utc::now() + chrono::Duration::days(300));

        // Nothing due on the next tick.
        assert_eq!(sched.tick().await, 0);
    }

    #[tokio::test]
    async fn recurring_schedule_creates_run_and_advances() {
        let store = Arc::new(MemStore::new());
        seed_healthy_host(&store).await;
        store
            .create_schedule(recurring("every-30m", 30, None))
            .await
            .unwrap();

        let executor = Arc::new(RecordingExecutor {
            store: store.clone(),
        });
        let sched = scheduler(store.clone(), executor);
        let before = Utc::now();
        assert_eq!(sched.tick().await, 1);

        let runs = store.list_runs(Default::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);

        let schedule = &store.list_schedules().await.unwrap()[0];
        assert!(schedule.last_run_at.is_some());
        let next = schedule.next_run_at.unwrap();
        assert!(next >= before + chrono::Duration::minutes(29));
        // The claim is released after the tick.
        assert!(schedule.claimed_until.is_none());
    }

    #[tokio::test]
    async fn concurrency_cap_defers_with_backoff_and_releases_claim() {
        let store = Arc::new(MemStore::new());
        seed_healthy_host(&store).await;

        // A run already executing holds the single global slot.
        let (running, _jobs) = store
            .create_run_with_jobs(NewRun {
                directive_id: None,
                snapshot: DirectiveSnapshot::custom("", Utc::now()),
                approval: ApprovalStatus::None,
                worker_host_id: None,
                tasks: vec![TaskKind::LogTriage],
            })
            .await
            .unwrap();
        store.mark_run_running(running.id, Utc::now()).await.unwrap();

        store
            .create_schedule(recurring("capped", 30, Some(1)))
            .await
            .unwrap();

        let executor = Arc::new(StubExecutor::succeeding());
        let sched = scheduler(store.clone(), executor.clone());
        let before = Utc::now();
        assert_eq!(sched.tick().await, 0);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        let schedule = &store.list_schedules().await.unwrap()[0];
        let next = schedule.next_run_at.unwrap();
        assert!(next >= before + chrono::Duration::seconds(59));
        assert!(schedule.claimed_until.is_none());

        // Once the blocking run finishes, the schedule dispatches after its
        // backoff elapses. Simulate by making it due again.
        store
            .finish_run(
                running.id,
                RunStatus::Success,
                Utc::now(),
                "",
                &serde_json::json!({}),
                "",
            )
            .await
            .unwrap();
        store
            .defer_schedule(schedule.id, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(sched.tick().await, 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn claimed_schedule_is_invisible_to_other_schedulers() {
        let store = Arc::new(MemStore::new());
        seed_healthy_host(&store).await;
        let schedule = store
            .create_schedule(recurring("contended", 30, None))
            .await
            .unwrap();

        // Process A claimed the schedule and died mid-dispatch.
        let claimed = store
            .claim_due_schedules(Utc::now(), "proc-a", Duration::from_secs(120), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        // Process B ticks before the TTL: nothing to do.
        let executor = Arc::new(StubExecutor::succeeding());
        let sched = scheduler(store.clone(), executor.clone());
        assert_eq!(sched.tick().await, 0);

        // After the TTL expires the schedule is claimable again.
        store.release_schedule_claim(schedule.id).await.unwrap();
        assert_eq!(sched.tick().await, 1);
    }

    #[tokio::test]
    async fn cancelled_run_is_skipped_without_touching_a_host() {
        let store = Arc::new(MemStore::new());
        // Deliberately no healthy host: a cancelled run must not need one.
        let launcher = crate::launcher::RunLauncher::new(store.clone());
        let run = launcher
            .launch(crate::launcher::LaunchRequest {
                custom_directive_text: Some("ad-hoc".to_string()),
                tasks: Some(vec![TaskKind::LogTriage]),
                ..Default::default()
            })
            .await
            .unwrap();
        store.cancel_run(run.id, Utc::now()).await.unwrap();

        let executor = Arc::new(StubExecutor::succeeding());
        let sched = scheduler(store.clone(), executor.clone());
        assert_eq!(sched.tick().await, 0);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        let history = store
            .schedule_history(store.list_schedules().await.unwrap()[0].id, 10)
            .await
            .unwrap();
        assert_eq!(history[0].status, ScheduledRunStatus::Finished);
        assert_eq!(history[0].error_summary, "cancelled before dispatch");
    }

    #[tokio::test]
    async fn gpu_required_run_routes_to_gpu_capable_host() {
        let store = Arc::new(MemStore::new());
        seed_healthy_host(&store).await; // CPU-only
        let gpu_host = crate::testing::seed_healthy_host(store.as_ref(), "gpu-box", true).await;
        crate::testing::seed_image(store.as_ref(), "dockhand/gpu-report", true).await;

        store
            .create_schedule(NewSchedule {
                name: "gpu-sweep".to_string(),
                task_kind: TaskKind::GpuReport,
                directive_id: None,
                custom_directive_text: "sample the GPUs".to_string(),
                enabled: true,
                kind: ScheduleKind::Interval,
                interval_minutes: Some(30),
                cron_expr: None,
                timezone: "UTC".to_string(),
                task3_scope: TaskScope::Allowlist,
                max_global: None,
                max_per_job: None,
                next_run_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            })
            .await
            .unwrap();

        let executor = Arc::new(StubExecutor::succeeding());
        let sched = scheduler(store.clone(), executor);
        assert_eq!(sched.tick().await, 1);

        let runs = store.list_runs(Default::default()).await.unwrap();
        assert_eq!(runs[0].worker_host_id, Some(gpu_host.id));
    }

    #[tokio::test]
    async fn no_eligible_host_is_recorded_not_thrown() {
        let store = Arc::new(MemStore::new());
        store
            .create_schedule(recurring("no-hosts", 30, None))
            .await
            .unwrap();

        let executor = Arc::new(StubExecutor::succeeding());
        let sched = scheduler(store.clone(), executor.clone());
        assert_eq!(sched.tick().await, 0);

        let runs = store.list_runs(Default::default()).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        let history = store
            .schedule_history(store.list_schedules().await.unwrap()[0].id, 10)
            .await
            .unwrap();
        assert_eq!(history[0].status, ScheduledRunStatus::Failed);
        assert_eq!(history[0].error_summary, "no_eligible_host");
    }

    #[test]
    fn one_shot_next_run_lands_in_the_far_future() {
        let now = Utc::now();
        let schedule = Schedule {
            id: uuid::Uuid::new_v4(),
            name: "one-shot".into(),
            task_kind: TaskKind::LogTriage,
            directive_id: None,
            custom_directive_text: String::new(),
            enabled: true,
            kind: ScheduleKind::Interval,
            interval_minutes: None,
            cron_expr: None,
            timezone: "UTC".into(),
            task3_scope: TaskScope::Allowlist,
            max_global: None,
            max_per_job: None,
            last_run_at: None,
            next_run_at: Some(now),
            claimed_by: String::new(),
            claimed_until: None,
            created_at: now,
            updated_at: now,
        };
        let next = compute_next_run(&schedule, now).unwrap();
        assert!(next > now + chrono::Duration::days(365));
    }

    #[test]
    fn cron_next_run_respects_timezone() {
        let now = Utc::now();
        let schedule = Schedule {
            id: uuid::Uuid::new_v4(),
            name: "cron".into(),
            task_kind: TaskKind::GpuReport,
            directive_id: None,
            custom_directive_text: String::new(),
            enabled: true,
            kind: ScheduleKind::Cron,
            interval_minutes: None,
            // Every hour on the hour (cron crate format includes seconds).
            cron_expr: Some("0 0 * * * *".to_string()),
            timezone: "America/New_York".into(),
            task3_scope: TaskScope::Allowlist,
            max_global: None,
            max_per_job: None,
            last_run_at: None,
            next_run_at: Some(now),
            claimed_by: String::new(),
            claimed_until: None,
            created_at: now,
            updated_at: now,
        };
        let next = compute_next_run(&schedule, now).unwrap();
        assert!(next > now);
        assert!(next <= now + chrono::Duration::hours(1));
        // Monotone: recomputing from the new time moves forward.
        let after = compute_next_run(&schedule, next).unwrap();
        assert!(after > next);
    }
}
