//! Urgent-program reminders: the per-cycle pipeline, the dispatch queue that
//! hands trigger calls to a background worker, and the recurring scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ospm_core::{urgent_programs, EmailAddress, Program};
use ospm_storage::{
    CatalogStore, HttpWorkflowTrigger, LedgerStore, StoreLayout, SubscriptionRegistry, TriggerConfig,
    TriggerRequest, WorkflowTrigger,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ospm-notify";

pub const DAILY_REMINDER_NOTE: &str = "Daily urgent programs reminder";
pub const SUBSCRIPTION_NOTE: &str = "New subscription from website";

#[derive(Debug, Clone)]
pub struct ReminderConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub daily_flow: String,
    pub subscribe_flow: String,
}

impl ReminderConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("OSPM_REMINDERS_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            interval: Duration::from_secs(
                3600 * std::env::var("OSPM_REMINDER_INTERVAL_HOURS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|h| *h > 0)
                    .unwrap_or(24),
            ),
            daily_flow: std::env::var("KESTRA_FLOW_DAILY")
                .unwrap_or_else(|_| "daily-reminder".to_string()),
            subscribe_flow: std::env::var("KESTRA_FLOW_SUBSCRIBE")
                .unwrap_or_else(|_| "subscription-success".to_string()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch queue is closed")]
    Closed,
}

/// Hands trigger requests to a background worker. Callers only learn whether
/// the request was accepted; delivery outcomes show up in the logs.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<TriggerRequest>,
}

impl DispatchQueue {
    pub fn unbounded() -> (Self, mpsc::UnboundedReceiver<TriggerRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Starts the worker; it runs until every queue handle is dropped.
    pub fn spawn(trigger: Arc<dyn WorkflowTrigger>) -> (Self, JoinHandle<()>) {
        let (queue, rx) = Self::unbounded();
        let worker = tokio::spawn(drain(rx, trigger));
        (queue, worker)
    }

    pub fn enqueue(&self, request: TriggerRequest) -> Result<(), DispatchError> {
        self.tx.send(request).map_err(|_| DispatchError::Closed)
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<TriggerRequest>, trigger: Arc<dyn WorkflowTrigger>) {
    while let Some(request) = rx.recv().await {
        match trigger.trigger(&request).await {
            Ok(()) => info!(flow_id = %request.flow_id, "workflow execution started"),
            Err(err) => warn!(
                flow_id = %request.flow_id,
                transient = err.is_transient(),
                "workflow execution failed: {err}"
            ),
        }
    }
}

pub fn subscription_confirmation(flow_id: &str, email: &EmailAddress) -> TriggerRequest {
    TriggerRequest::new(flow_id)
        .input("email", email.as_str())
        .input("status", "subscribed")
        .input("note", SUBSCRIPTION_NOTE)
}

pub fn daily_reminder(flow_id: &str, email: &str, programs: &[&Program]) -> Result<TriggerRequest> {
    let programs = serde_json::to_string(programs).context("serializing reminder programs")?;
    Ok(TriggerRequest::new(flow_id)
        .input("email", email)
        .input("programs", programs)
        .input("note", DAILY_REMINDER_NOTE))
}

#[derive(Debug, Clone, Serialize)]
pub struct ReminderRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub urgent_programs: usize,
    pub subscribers: usize,
    pub notified_subscribers: usize,
    pub dispatched_programs: usize,
}

pub struct ReminderPipeline {
    catalog: Arc<CatalogStore>,
    registry: Arc<SubscriptionRegistry>,
    ledger: LedgerStore,
    queue: DispatchQueue,
    daily_flow: String,
}

impl ReminderPipeline {
    pub fn new(
        catalog: Arc<CatalogStore>,
        registry: Arc<SubscriptionRegistry>,
        ledger: LedgerStore,
        queue: DispatchQueue,
        daily_flow: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            registry,
            ledger,
            queue,
            daily_flow: daily_flow.into(),
        }
    }

    /// One reminder cycle. A subscriber's ledger entry only grows by the ids
    /// in a request the dispatch queue accepted.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReminderRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let catalog = self.catalog.load().await;
        let urgent = urgent_programs(&catalog, now.naive_utc());
        let subscribers = self.registry.list().await;
        let mut ledger = self.ledger.load().await;

        let mut notified_subscribers = 0usize;
        let mut dispatched_programs = 0usize;

        for email in &subscribers {
            let to_send: Vec<&Program> = urgent
                .iter()
                .filter(|p| !ledger.was_sent(email, p.id))
                .collect();
            if to_send.is_empty() {
                continue;
            }

            let request = daily_reminder(&self.daily_flow, email, &to_send)?;
            if let Err(err) = self.queue.enqueue(request) {
                warn!(%run_id, email = %email, "skipping reminder: {err}");
                continue;
            }
            ledger.record(email, to_send.iter().map(|p| p.id));
            notified_subscribers += 1;
            dispatched_programs += to_send.len();
        }

        self.ledger
            .save(&ledger)
            .await
            .context("persisting sent-notification ledger")?;

        let summary = ReminderRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            urgent_programs: urgent.len(),
            subscribers: subscribers.len(),
            notified_subscribers,
            dispatched_programs,
        };
        info!(
            %run_id,
            urgent = summary.urgent_programs,
            subscribers = summary.subscribers,
            notified = summary.notified_subscribers,
            dispatched = summary.dispatched_programs,
            "reminder cycle complete"
        );
        Ok(summary)
    }

    /// `run_once` at the current time; failures are logged, never returned.
    pub async fn run_cycle(&self) -> Option<ReminderRunSummary> {
        match self.run_once(Utc::now()).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!("reminder cycle failed: {err:#}");
                None
            }
        }
    }
}

/// Runs one cycle right away, then repeats every `interval` for as long as
/// the returned scheduler lives.
pub async fn start_scheduler(pipeline: Arc<ReminderPipeline>, interval: Duration) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let repeated = pipeline.clone();
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let pipeline = repeated.clone();
        Box::pin(async move {
            pipeline.run_cycle().await;
        })
    })
    .context("creating reminder job")?;
    sched.add(job).await.context("adding reminder job")?;
    sched.start().await.context("starting scheduler")?;

    tokio::spawn(async move {
        pipeline.run_cycle().await;
    });
    info!(interval_secs = interval.as_secs(), "reminder scheduler started");
    Ok(sched)
}

/// Runs a single reminder cycle against the environment-configured stores and
/// waits for the queued trigger calls to finish.
pub async fn run_reminder_once_from_env() -> Result<ReminderRunSummary> {
    let layout = StoreLayout::from_env();
    let config = ReminderConfig::from_env();
    let trigger = Arc::new(HttpWorkflowTrigger::new(TriggerConfig::from_env())?);
    let (queue, worker) = DispatchQueue::spawn(trigger);
    let ledger = LedgerStore::new(&layout.ledger);
    ledger.ensure_exists().await?;

    let pipeline = ReminderPipeline::new(
        Arc::new(CatalogStore::from_layout(&layout)),
        Arc::new(SubscriptionRegistry::load(&layout.subscriptions).await),
        ledger,
        queue,
        config.daily_flow,
    );
    let summary = pipeline.run_once(Utc::now()).await;
    drop(pipeline);
    worker.await.context("joining dispatch worker")?;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use ospm_core::Difficulty;
    use ospm_storage::{write_json_atomic, StoreLayout, TriggerError};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        layout: StoreLayout,
        catalog: Arc<CatalogStore>,
        registry: Arc<SubscriptionRegistry>,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).single().unwrap()
    }

    fn program(id: u64, deadline: &str, tags: &[&str]) -> Program {
        Program {
            id,
            name: format!("Program {id}"),
            slug: format!("program-{id}"),
            difficulty: Difficulty::Beginner,
            program_type: "Open Source".to_string(),
            timeline: String::new(),
            opens_in: String::new(),
            deadline: deadline.to_string(),
            description: String::new(),
            official_site: format!("https://p{id}.dev"),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            tech: None,
        }
    }

    async fn fixture(programs: Vec<Program>, subscribers: &[&str]) -> Fixture {
        let dir = tempdir().expect("tempdir");
        let layout = StoreLayout::under(dir.path());
        write_json_atomic(&layout.catalog, &programs).await.expect("seed catalog");
        let registry = SubscriptionRegistry::load(&layout.subscriptions).await;
        for email in subscribers {
            registry.subscribe(email).await.expect("valid email");
        }
        Fixture {
            catalog: Arc::new(CatalogStore::from_layout(&layout)),
            registry: Arc::new(registry),
            layout,
            _dir: dir,
        }
    }

    fn pipeline(fx: &Fixture, queue: DispatchQueue) -> ReminderPipeline {
        ReminderPipeline::new(
            fx.catalog.clone(),
            fx.registry.clone(),
            LedgerStore::new(&fx.layout.ledger),
            queue,
            "daily-reminder",
        )
    }

    fn drain_now(rx: &mut mpsc::UnboundedReceiver<TriggerRequest>) -> Vec<TriggerRequest> {
        let mut out = Vec::new();
        while let Ok(req) = rx.try_recv() {
            out.push(req);
        }
        out
    }

    fn program_ids(request: &TriggerRequest) -> Vec<u64> {
        let programs: Vec<Program> =
            serde_json::from_str(request.get("programs").expect("programs field")).unwrap();
        programs.iter().map(|p| p.id).collect()
    }

    #[tokio::test]
    async fn only_urgent_programs_are_dispatched() {
        let fx = fixture(
            vec![
                program(1, "2026-10-21", &[]),
                program(2, "2026-11-17", &[]),
                program(3, "Rolling", &["Urgent"]),
            ],
            &["a@b.co"],
        )
        .await;
        let (queue, mut rx) = DispatchQueue::unbounded();
        let summary = pipeline(&fx, queue).run_once(now()).await.expect("cycle");

        assert_eq!(summary.urgent_programs, 2);
        let sent = drain_now(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].flow_id, "daily-reminder");
        assert_eq!(sent[0].get("email"), Some("a@b.co"));
        assert_eq!(sent[0].get("note"), Some(DAILY_REMINDER_NOTE));
        assert_eq!(program_ids(&sent[0]), vec![1, 3]);
    }

    #[tokio::test]
    async fn ledger_prevents_repeat_announcements() {
        let fx = fixture(vec![program(1, "", &["paid"])], &["a@b.co", "c@d.io"]).await;
        let (queue, mut rx) = DispatchQueue::unbounded();
        let pipeline = pipeline(&fx, queue);

        let first = pipeline.run_once(now()).await.expect("first");
        assert_eq!(first.notified_subscribers, 2);
        assert_eq!(drain_now(&mut rx).len(), 2);

        let second = pipeline.run_once(now()).await.expect("second");
        assert_eq!(second.notified_subscribers, 0);
        assert!(drain_now(&mut rx).is_empty());

        let mut programs = fx.catalog.load().await;
        programs.push(program(2, "", &["internship"]));
        programs.push(Program {
            program_type: "Internship".into(),
            ..program(3, "", &[])
        });
        fx.catalog.save(&programs).await.expect("save");

        pipeline.run_once(now()).await.expect("third");
        let sent = drain_now(&mut rx);
        assert_eq!(sent.len(), 2);
        for req in &sent {
            assert_eq!(program_ids(req), vec![3]);
        }

        let ledger = LedgerStore::new(&fx.layout.ledger).load().await;
        assert_eq!(
            serde_json::to_value(&ledger).unwrap()["a@b.co"],
            serde_json::json!([1, 3])
        );
    }

    #[tokio::test]
    async fn subscribers_with_nothing_new_leave_no_ledger_entry() {
        let fx = fixture(vec![program(1, "", &[])], &["a@b.co"]).await;
        let (queue, mut rx) = DispatchQueue::unbounded();
        let summary = pipeline(&fx, queue).run_once(now()).await.expect("cycle");
        assert_eq!(summary.urgent_programs, 0);
        assert!(drain_now(&mut rx).is_empty());
        let ledger = LedgerStore::new(&fx.layout.ledger).load().await;
        assert_eq!(serde_json::to_value(&ledger).unwrap(), serde_json::json!({}));
        assert!(fx.layout.ledger.exists(), "ledger is written every cycle");
    }

    #[tokio::test]
    async fn rejected_enqueue_is_not_recorded() {
        let fx = fixture(vec![program(1, "", &["paid"])], &["a@b.co"]).await;
        let (queue, rx) = DispatchQueue::unbounded();
        drop(rx);
        let summary = pipeline(&fx, queue).run_once(now()).await.expect("cycle");
        assert_eq!(summary.notified_subscribers, 0);
        let ledger = LedgerStore::new(&fx.layout.ledger).load().await;
        assert!(!ledger.was_sent("a@b.co", 1));
    }

    #[tokio::test]
    async fn failing_cycle_is_swallowed() {
        let fx = fixture(vec![program(1, "", &["paid"])], &["a@b.co"]).await;
        std::fs::create_dir_all(&fx.layout.ledger).expect("directory in place of ledger file");
        let (queue, _rx) = DispatchQueue::unbounded();
        assert!(pipeline(&fx, queue).run_cycle().await.is_none());
    }

    #[derive(Default)]
    struct RecordingTrigger {
        calls: Mutex<Vec<TriggerRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl WorkflowTrigger for RecordingTrigger {
        async fn trigger(&self, request: &TriggerRequest) -> Result<(), TriggerError> {
            self.calls.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(TriggerError::HttpStatus {
                    status: 503,
                    url: "http://kestra/test".into(),
                    body: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    async fn wait_for_calls(trigger: &RecordingTrigger, n: usize) -> Vec<TriggerRequest> {
        for _ in 0..250 {
            let calls = trigger.calls.lock().unwrap().clone();
            if calls.len() >= n {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        trigger.calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn worker_keeps_draining_after_failures() {
        let trigger = Arc::new(RecordingTrigger {
            fail: true,
            ..Default::default()
        });
        let (queue, worker) = DispatchQueue::spawn(trigger.clone());
        let email = EmailAddress::parse("a@b.co").unwrap();
        queue
            .enqueue(subscription_confirmation("subscription-success", &email))
            .unwrap();
        queue.enqueue(TriggerRequest::new("other")).unwrap();
        drop(queue);
        worker.await.expect("worker exits once the queue is dropped");

        let calls = trigger.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].get("status"), Some("subscribed"));
        assert_eq!(calls[0].get("note"), Some(SUBSCRIPTION_NOTE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scheduler_runs_a_cycle_at_startup() {
        let fx = fixture(vec![program(1, "", &["paid"])], &["a@b.co"]).await;
        let trigger = Arc::new(RecordingTrigger::default());
        let (queue, _worker) = DispatchQueue::spawn(trigger.clone());
        let pipeline = Arc::new(pipeline(&fx, queue));

        let mut sched = start_scheduler(pipeline, Duration::from_secs(24 * 3600))
            .await
            .expect("scheduler");
        let calls = wait_for_calls(&trigger, 1).await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].get("email"), Some("a@b.co"));
        sched.shutdown().await.expect("shutdown");
    }
}
