use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    agent::Investigator,
    dedup::DedupCache,
    models::{IncidentCard, InvestigationOutcome, Notification},
    sink::{AllowAll, ReportGate, SinkDispatcher, SinkEvent},
    watcher::Watcher,
};

/// Pipeline counters exposed by the status API.
#[derive(Debug, Default)]
pub struct IncidentCounters {
    started: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    unrouted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub unrouted: u64,
}

impl IncidentCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &InvestigationOutcome) {
        let counter = match outcome {
            InvestigationOutcome::Completed { .. } => &self.completed,
            InvestigationOutcome::Aborted { .. } => &self.aborted,
            InvestigationOutcome::Failed { .. } => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SentinelSettings {
    pub queue_capacity: usize,
    pub worker_concurrency: usize,
}

impl Default for SentinelSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            worker_concurrency: 1,
        }
    }
}

/// Dedup and card lookup. Only the consumer loop calls into it.
struct IncidentRouter {
    cards: HashMap<String, IncidentCard>,
    dedup: Arc<DedupCache>,
    counters: Arc<IncidentCounters>,
}

impl IncidentRouter {
    fn new(cards: Vec<IncidentCard>, dedup: Arc<DedupCache>, counters: Arc<IncidentCounters>) -> Self {
        let mut by_resource = HashMap::with_capacity(cards.len());
        for card in cards {
            let resource = card.resource.name.clone();
            if by_resource.contains_key(&resource) {
                warn!(resource = %resource, card = %card.name, "Multiple incident cards for one resource, keeping first");
                continue;
            }
            by_resource.insert(resource, card);
        }
        Self {
            cards: by_resource,
            dedup,
            counters,
        }
    }

    async fn route(&self, notification: Notification) -> Option<IncidentCard> {
        let resource = notification.resource;
        let resource_id = resource.id();

        if !self.dedup.check_and_insert(&resource_id).await {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(resource_id = %resource_id, resource = %resource.name, "Duplicate notification, skipping");
            return None;
        }

        let Some(card) = self.cards.get(&resource.name) else {
            self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
            warn!(resource_id = %resource_id, resource = %resource.name, "No incident card matches resource");
            return None;
        };

        Some(card.bind(resource))
    }
}

/// Runs one incident end to end: start event, investigation, gated report.
struct IncidentWorker {
    investigator: Investigator,
    sinks: Arc<SinkDispatcher>,
    gate: Arc<dyn ReportGate>,
    counters: Arc<IncidentCounters>,
}

impl IncidentWorker {
    async fn handle(&self, card: IncidentCard, cancel: &CancellationToken) {
        let incident_id = Uuid::new_v4().to_string();
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        info!(
            incident_id = %incident_id,
            card = %card.name,
            resource = %card.resource.name,
            alertname = card.resource.labels.get("alertname").map(String::as_str).unwrap_or_default(),
            state = %card.resource.state,
            timestamp = %card.resource.timestamp,
            "Incident detected"
        );
        self.sinks
            .dispatch(&card.sinks, &SinkEvent::started(&incident_id, &card))
            .await;

        let report = self.investigator.investigate(&incident_id, &card, cancel).await;
        self.counters.record(&report.outcome);

        match self.gate.review(&report).await {
            Ok(()) => {
                self.sinks
                    .dispatch(&card.sinks, &SinkEvent::finished(&report))
                    .await
            }
            Err(reason) => warn!(
                incident_id = %incident_id,
                card = %card.name,
                reason = %reason,
                "Report gate suppressed incident report"
            ),
        }
    }
}

/// Owns the notification channel and turns notifications into investigations.
pub struct Sentinel {
    settings: SentinelSettings,
    router: IncidentRouter,
    worker: IncidentWorker,
    watchers: Vec<Box<dyn Watcher>>,
    tx: mpsc::Sender<Notification>,
    rx: mpsc::Receiver<Notification>,
}

impl Sentinel {
    pub fn new(
        settings: SentinelSettings,
        cards: Vec<IncidentCard>,
        investigator: Investigator,
        dedup: Arc<DedupCache>,
        sinks: Arc<SinkDispatcher>,
        counters: Arc<IncidentCounters>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            settings,
            router: IncidentRouter::new(cards, dedup, counters.clone()),
            worker: IncidentWorker {
                investigator,
                sinks,
                gate: Arc::new(AllowAll),
                counters,
            },
            watchers: Vec::new(),
            tx,
            rx,
        }
    }

    pub fn with_watchers(mut self, watchers: Vec<Box<dyn Watcher>>) -> Self {
        self.watchers.extend(watchers);
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn ReportGate>) -> Self {
        self.worker.gate = gate;
        self
    }

    /// Another producer for the shared channel. The consumer stops once every
    /// sender, including watcher-owned ones, is dropped.
    #[cfg(test)]
    pub fn sender(&self) -> mpsc::Sender<Notification> {
        self.tx.clone()
    }

    /// Runs until `cancel` fires or every producer is gone.
    ///
    /// On cancellation: watchers exit first, the channel is closed and its
    /// backlog discarded uninvestigated, then in-flight investigations are
    /// awaited.
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            settings,
            router,
            worker,
            watchers,
            tx,
            mut rx,
        } = self;
        let worker = Arc::new(worker);

        let mut watcher_tasks = JoinSet::new();
        for watcher in watchers {
            let tx = tx.clone();
            let cancel = cancel.clone();
            watcher_tasks.spawn(async move {
                watcher.run(tx, cancel).await;
            });
        }
        drop(tx);

        let workers = settings.worker_concurrency.max(1);
        info!(
            watchers = watcher_tasks.len(),
            cards = router.cards.len(),
            workers,
            "Sentinel started"
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut in_flight = JoinSet::new();

        loop {
            let notification = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(notification) => notification,
                    None => break,
                },
            };

            let Some(card) = router.route(notification).await else {
                continue;
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(card = %card.name, "Shutdown requested, discarding routed incident without investigating");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = worker.clone();
            let cancel = cancel.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                worker.handle(card, &cancel).await;
            });

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(err) = joined {
                    error!("Investigation task panicked: {err}");
                }
            }
        }

        while let Some(joined) = watcher_tasks.join_next().await {
            if let Err(err) = joined {
                error!("Watcher task panicked: {err}");
            }
        }

        rx.close();
        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            info!(
                count = discarded,
                "Discarded queued notifications on shutdown without investigating"
            );
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                error!("Investigation task panicked: {err}");
            }
        }
        info!("Sentinel stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        agent::testing::{text, FakeTools, ScriptedBackend},
        models::{McpTool, Resource},
        sink::{testing::RecordingSink, SinkEventKind},
    };

    fn ceph_card() -> IncidentCard {
        IncidentCard {
            name: "ceph-health".to_string(),
            resource: Resource {
                name: "ceph-health".to_string(),
                ..Default::default()
            },
            prompt: "Ceph is unhealthy".to_string(),
            tools: McpTool::parse("juju.get_status").into_iter().collect(),
            max_iterations: 5,
            model: None,
            sinks: vec!["recorder".to_string()],
        }
    }

    fn notification(name: &str, timestamp: &str) -> Notification {
        Notification {
            resource: Resource {
                r#type: "prometheus_alert".to_string(),
                name: name.to_string(),
                labels: [("alertname".to_string(), "CephHealthError".to_string())].into(),
                state: "firing".to_string(),
                timestamp: timestamp.to_string(),
                ..Default::default()
            },
        }
    }

    struct Harness {
        sentinel: Sentinel,
        backend: Arc<ScriptedBackend>,
        recorder: Arc<RecordingSink>,
        counters: Arc<IncidentCounters>,
        dedup: Arc<DedupCache>,
    }

    fn harness(settings: SentinelSettings) -> Harness {
        let tools = Arc::new(FakeTools::default().with_tool("juju", "get_status"));
        let backend = Arc::new(ScriptedBackend::repeating(text("Cluster recovered.")));
        let recorder = Arc::new(RecordingSink::default());
        let mut sinks = SinkDispatcher::default();
        sinks.register("recorder", recorder.clone());
        let counters = Arc::new(IncidentCounters::default());
        let dedup = Arc::new(DedupCache::new(Duration::from_secs(600), 100));

        let sentinel = Sentinel::new(
            settings,
            vec![ceph_card()],
            Investigator::new(tools, backend.clone(), "gpt-4o", None),
            dedup.clone(),
            Arc::new(sinks),
            counters.clone(),
        );
        Harness {
            sentinel,
            backend,
            recorder,
            counters,
            dedup,
        }
    }

    #[tokio::test]
    async fn duplicate_notifications_start_one_investigation() {
        let h = harness(SentinelSettings::default());
        let tx = h.sentinel.sender();
        tx.send(notification("ceph-health", "2025-01-01T00:00:00Z"))
            .await
            .expect("send");
        tx.send(notification("ceph-health", "2025-01-01T00:00:00Z"))
            .await
            .expect("send");
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), h.sentinel.run(CancellationToken::new()))
            .await
            .expect("sentinel stops once producers are gone");

        assert_eq!(h.backend.calls(), 1);
        let counters = h.counters.snapshot();
        assert_eq!(counters.started, 1);
        assert_eq!(counters.completed, 1);
        assert_eq!(counters.duplicates, 1);
        assert_eq!(h.dedup.len().await, 1);
        assert_eq!(
            h.recorder.kinds(),
            vec![SinkEventKind::Started, SinkEventKind::Completed]
        );
    }

    #[tokio::test]
    async fn unrouted_notifications_are_counted_and_dropped() {
        let h = harness(SentinelSettings::default());
        let tx = h.sentinel.sender();
        tx.send(notification("osd-down", "2025-01-01T00:00:00Z"))
            .await
            .expect("send");
        drop(tx);

        h.sentinel.run(CancellationToken::new()).await;
        assert_eq!(h.backend.calls(), 0);
        assert_eq!(h.counters.snapshot().unrouted, 1);
        assert!(h.recorder.kinds().is_empty());
    }

    #[tokio::test]
    async fn queued_notifications_are_discarded_on_shutdown() {
        let h = harness(SentinelSettings::default());
        let tx = h.sentinel.sender();
        tx.send(notification("ceph-health", "2025-01-01T00:00:00Z"))
            .await
            .expect("send");
        tx.send(notification("ceph-health", "2025-01-01T00:10:00Z"))
            .await
            .expect("send");

        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), h.sentinel.run(cancel))
            .await
            .expect("sentinel stops on cancellation");
        drop(tx);

        assert_eq!(h.backend.calls(), 0);
        assert_eq!(h.counters.snapshot().started, 0);
        assert_eq!(h.dedup.len().await, 0);
        assert!(h.recorder.kinds().is_empty());
    }

    struct DenyAll;

    #[async_trait]
    impl ReportGate for DenyAll {
        async fn review(&self, _report: &crate::models::IncidentReport) -> Result<(), String> {
            Err("held for review".to_string())
        }
    }

    #[tokio::test]
    async fn gate_suppresses_finished_report() {
        let h = harness(SentinelSettings::default());
        let sentinel = h.sentinel.with_gate(Arc::new(DenyAll));
        let tx = sentinel.sender();
        tx.send(notification("ceph-health", "2025-01-01T00:00:00Z"))
            .await
            .expect("send");
        drop(tx);

        sentinel.run(CancellationToken::new()).await;
        assert_eq!(h.counters.snapshot().completed, 1);
        assert_eq!(h.recorder.kinds(), vec![SinkEventKind::Started]);
    }

    /// Emits its notifications once, then idles until cancelled.
    struct OneShotWatcher {
        notifications: Vec<Notification>,
    }

    #[async_trait]
    impl Watcher for OneShotWatcher {
        fn name(&self) -> &str {
            "one-shot"
        }

        async fn run(&self, tx: mpsc::Sender<Notification>, cancel: CancellationToken) {
            for notification in &self.notifications {
                let _ = tx.try_send(notification.clone());
            }
            cancel.cancelled().await;
        }
    }

    #[tokio::test]
    async fn cancellation_stops_watchers_and_waits_for_workers() {
        let h = harness(SentinelSettings {
            queue_capacity: 8,
            worker_concurrency: 2,
        });
        let sentinel = h.sentinel.with_watchers(vec![Box::new(OneShotWatcher {
            notifications: vec![
                notification("ceph-health", "2025-01-01T00:00:00Z"),
                notification("ceph-health", "2025-01-01T00:00:00Z"),
                notification("ceph-health", "2025-01-01T00:10:00Z"),
            ],
        })]);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sentinel.run(cancel.clone()));

        let counters = h.counters.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while counters.snapshot().completed < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("both distinct occurrences investigated");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sentinel stops after cancellation")
            .expect("join");

        let counters = h.counters.snapshot();
        assert_eq!(counters.started, 2);
        assert_eq!(counters.duplicates, 1);
        assert_eq!(h.backend.calls(), 2);
    }
}
