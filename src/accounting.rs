//! Call accounting.
//!
//! Three kinds of counters live here:
//!
//! - [`CallAccounting`]: process-wide received/processed/error/timeout
//!   [`Flow`]s plus per-method latency, shared by every service.
//! - [`ClientCallCounter`]: per service, a two-level concurrent map
//!   `client address -> method -> count`, created lazily on first call.
//! - [`NetworkCounters`]: bytes and frames read/written, live connections.
//!
//! A reporter task ([`spawn_reporter`]) turns the aggregate flows into
//! per-interval deltas, keeps the latest [`StatReport`] for INFO queries and
//! hands a copy to an optional [`StatMonitor`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::protocol::now_millis;

/// Header line of the periodic stat log.
const STAT_HEADER: &str = "RECV\tPROC\tERROR\tTIMEOUT\tINVOKE\tQUEUE\tNETWORK";

/// Re-emit the header after this many ticks.
const HEADER_EVERY: u32 = 10;

/// Monotonic counter that can also report its change since the last read.
#[derive(Debug, Default)]
pub struct Flow {
    count: AtomicU64,
    last: AtomicU64,
}

impl Flow {
    #[inline]
    pub fn incr(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    /// Total since creation.
    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Increase since the previous call to `changes`.
    pub fn changes(&self) -> u64 {
        let now = self.count.load(Ordering::Relaxed);
        let last = self.last.swap(now, Ordering::Relaxed);
        now.saturating_sub(last)
    }
}

/// Latency totals for one method.
#[derive(Debug, Default)]
struct Latency {
    calls: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

/// Point-in-time view of one method's latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub calls: u64,
    pub total_micros: u64,
    pub max_micros: u64,
}

impl LatencySnapshot {
    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_micros / self.calls)
    }
}

/// Process-wide call counters.
#[derive(Debug, Default)]
pub struct CallAccounting {
    received: Flow,
    processed: Flow,
    errors: Flow,
    timeouts: Flow,
    latency: DashMap<String, Latency>,
    last_report: Mutex<StatReport>,
}

impl CallAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_received(&self) {
        self.received.incr(1);
    }

    pub fn incr_processed(&self) {
        self.processed.incr(1);
    }

    pub fn incr_error(&self) {
        self.errors.incr(1);
    }

    pub fn incr_timeout(&self) {
        self.timeouts.incr(1);
    }

    /// Totals since start: (received, processed, error, timeout).
    pub fn totals(&self) -> (u64, u64, u64, u64) {
        (
            self.received.count(),
            self.processed.count(),
            self.errors.count(),
            self.timeouts.count(),
        )
    }

    /// Record how long one call to `service`/`method` took.
    pub fn record_latency(&self, service: &str, method: &str, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let key = latency_key(service, method);
        let entry = self.latency.entry(key).or_default();
        entry.calls.fetch_add(1, Ordering::Relaxed);
        entry.total_micros.fetch_add(micros, Ordering::Relaxed);
        entry.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn latency(&self, service: &str, method: &str) -> Option<LatencySnapshot> {
        self.latency
            .get(&latency_key(service, method))
            .map(|l| LatencySnapshot {
                calls: l.calls.load(Ordering::Relaxed),
                total_micros: l.total_micros.load(Ordering::Relaxed),
                max_micros: l.max_micros.load(Ordering::Relaxed),
            })
    }

    /// Take the deltas since the previous snapshot and combine them with the
    /// supplied gauges. The result is also kept as the latest report.
    pub fn snapshot(&self, gauges: Gauges) -> StatReport {
        let report = StatReport {
            timestamp: now_millis(),
            received: self.received.changes(),
            processed: self.processed.changes(),
            errors: self.errors.changes(),
            timeouts: self.timeouts.changes(),
            invoke_in_use: gauges.invoke_in_use,
            invoke_capacity: gauges.invoke_capacity,
            invoke_queued: gauges.invoke_queued,
            connections: gauges.connections,
        };
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = report.clone();
        report
    }

    /// Most recently published report.
    pub fn last_report(&self) -> StatReport {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn latency_key(service: &str, method: &str) -> String {
    format!("{}#{}", service, method)
}

/// Gauges sampled at each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub invoke_in_use: u64,
    pub invoke_capacity: u64,
    /// Calls waiting for a worker.
    pub invoke_queued: u64,
    pub connections: u64,
}

/// One interval's worth of call statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatReport {
    pub timestamp: i64,
    #[serde(rename = "received_Count")]
    pub received: u64,
    #[serde(rename = "processed_Count")]
    pub processed: u64,
    #[serde(rename = "error_Count")]
    pub errors: u64,
    #[serde(rename = "error_timeout_Count")]
    pub timeouts: u64,
    #[serde(rename = "threads_Value")]
    pub invoke_in_use: u64,
    pub invoke_capacity: u64,
    #[serde(rename = "task_queue")]
    pub invoke_queued: u64,
    #[serde(rename = "connection_count")]
    pub connections: u64,
}

/// External sink for periodic reports.
pub trait StatMonitor: Send + Sync + 'static {
    fn publish(&self, report: &StatReport);
}

impl<F> StatMonitor for F
where
    F: Fn(&StatReport) + Send + Sync + 'static,
{
    fn publish(&self, report: &StatReport) {
        self(report)
    }
}

/// Source of gauge values for the reporter.
pub type GaugeFn = Arc<dyn Fn() -> Gauges + Send + Sync>;

/// Spawn the periodic reporter.
///
/// Every `interval` it snapshots the aggregate deltas, logs a stat line and
/// calls the monitor. No lock is held while the monitor runs.
pub fn spawn_reporter(
    accounting: Arc<CallAccounting>,
    network: Arc<NetworkCounters>,
    interval: Duration,
    gauges: GaugeFn,
    monitor: Option<Arc<dyn StatMonitor>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        tracing::info!(target: "meshwire::stat", "{}", STAT_HEADER);
        let mut rotate = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let report = accounting.snapshot(gauges());
            let net = network.snapshot();

            if rotate == HEADER_EVERY {
                tracing::info!(target: "meshwire::stat", "{}", STAT_HEADER);
                rotate = 0;
            } else {
                rotate += 1;
            }
            tracing::info!(
                target: "meshwire::stat",
                "{}\t{}\t{}\t{}\t{}/{}\t{}\tR:{}KB/{}\tW:{}KB/{}\tCONN:{}",
                report.received,
                report.processed,
                report.errors,
                report.timeouts,
                report.invoke_in_use,
                report.invoke_capacity,
                report.invoke_queued,
                net.read_bytes / 1024,
                net.read_count,
                net.write_bytes / 1024,
                net.write_count,
                net.connections,
            );

            if let Some(monitor) = &monitor {
                monitor.publish(&report);
            }
        }
        tracing::debug!("stat reporter stopped");
    })
}

/// Per-service `client -> method -> count` map.
#[derive(Debug, Default)]
pub struct ClientCallCounter {
    clients: DashMap<String, DashMap<String, Flow>>,
}

impl ClientCallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one call, creating the client and method entries on first use.
    pub fn incr(&self, client: &str, method: &str) {
        if let Some(methods) = self.clients.get(client) {
            if let Some(flow) = methods.get(method) {
                flow.incr(1);
                return;
            }
            methods.entry(method.to_string()).or_default().incr(1);
            return;
        }
        self.clients
            .entry(client.to_string())
            .or_default()
            .entry(method.to_string())
            .or_default()
            .incr(1);
    }

    pub fn count(&self, client: &str, method: &str) -> u64 {
        self.clients
            .get(client)
            .and_then(|methods| methods.get(method).map(|f| f.count()))
            .unwrap_or(0)
    }

    /// Addresses that have called at least once.
    pub fn clients(&self) -> Vec<String> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop every client not in `live`. Returns how many were removed.
    pub fn retain_clients(&self, live: &HashSet<String>) -> usize {
        let before = self.clients.len();
        self.clients.retain(|client, _| live.contains(client));
        before.saturating_sub(self.clients.len())
    }

    /// Per-client view of the counters, sorted by client then method.
    pub fn snapshot(&self, service_name: &str) -> Vec<InvokePerClient> {
        let mut out: Vec<InvokePerClient> = self
            .clients
            .iter()
            .map(|entry| {
                let mut methods: Vec<MethodCount> = entry
                    .value()
                    .iter()
                    .map(|m| MethodCount {
                        name: m.key().clone(),
                        count: m.value().count(),
                    })
                    .collect();
                methods.sort_by(|a, b| a.name.cmp(&b.name));
                InvokePerClient {
                    client: entry.key().clone(),
                    service_name: service_name.to_string(),
                    methods,
                }
            })
            .collect();
        out.sort_by(|a, b| a.client.cmp(&b.client));
        out
    }
}

/// Calls from one client to one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokePerClient {
    pub client: String,
    pub service_name: String,
    pub methods: Vec<MethodCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCount {
    pub name: String,
    pub count: u64,
}

/// Transport counters updated by connection tasks.
#[derive(Debug, Default)]
pub struct NetworkCounters {
    read_bytes: AtomicU64,
    read_count: AtomicU64,
    write_bytes: AtomicU64,
    write_count: AtomicU64,
    connections: AtomicU64,
}

impl NetworkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// `frames` frames decoded out of `bytes` bytes read.
    pub fn record_read(&self, bytes: usize, frames: usize) {
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.read_count.fetch_add(frames as u64, Ordering::Relaxed);
    }

    /// `frames` frames totalling `bytes` bytes written.
    pub fn record_write(&self, bytes: usize, frames: usize) {
        self.write_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.write_count.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> NetworkStat {
        NetworkStat {
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            read_count: self.read_count.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            connections: self.connections(),
        }
    }
}

/// Cumulative transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStat {
    pub read_bytes: u64,
    pub read_count: u64,
    pub write_bytes: u64,
    pub write_count: u64,
    pub connections: u64,
}

/// Body of an INFO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoReport {
    pub network: NetworkStat,
    pub stat: StatReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_changes_are_deltas() {
        let flow = Flow::default();
        flow.incr(3);
        assert_eq!(flow.changes(), 3);
        assert_eq!(flow.changes(), 0);
        flow.incr(2);
        assert_eq!(flow.changes(), 2);
        assert_eq!(flow.count(), 5);
    }

    #[test]
    fn test_snapshot_resets_deltas_and_keeps_last() {
        let acc = CallAccounting::new();
        acc.incr_received();
        acc.incr_received();
        acc.incr_processed();
        acc.incr_timeout();

        let gauges = Gauges {
            invoke_in_use: 1,
            invoke_capacity: 8,
            invoke_queued: 0,
            connections: 2,
        };
        let first = acc.snapshot(gauges);
        assert_eq!((first.received, first.processed, first.errors, first.timeouts), (2, 1, 0, 1));
        assert_eq!(first.connections, 2);
        assert_eq!(acc.last_report(), first);

        let second = acc.snapshot(Gauges::default());
        assert_eq!(second.received, 0);
        assert_eq!(acc.totals(), (2, 1, 0, 1));
    }

    #[test]
    fn test_report_uses_stat_wire_keys() {
        let report = StatReport {
            received: 3,
            processed: 2,
            errors: 1,
            timeouts: 1,
            invoke_in_use: 4,
            ..StatReport::default()
        };
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["received_Count"], 3);
        assert_eq!(json["processed_Count"], 2);
        assert_eq!(json["error_Count"], 1);
        assert_eq!(json["error_timeout_Count"], 1);
        assert_eq!(json["threads_Value"], 4);
        assert_eq!(json["connection_count"], 0);
    }

    #[test]
    fn test_latency_tracking() {
        let acc = CallAccounting::new();
        acc.record_latency("/s", "get", Duration::from_millis(10));
        acc.record_latency("/s", "get", Duration::from_millis(30));

        let lat = acc.latency("/s", "get").unwrap();
        assert_eq!(lat.calls, 2);
        assert_eq!(lat.max_micros, 30_000);
        assert_eq!(lat.mean(), Duration::from_millis(20));
        assert!(acc.latency("/s", "put").is_none());
    }

    #[test]
    fn test_client_counter_lazy_entries() {
        let counter = ClientCallCounter::new();
        assert_eq!(counter.count("a:1", "get"), 0);

        counter.incr("a:1", "get");
        counter.incr("a:1", "get");
        counter.incr("a:1", "put");
        counter.incr("b:2", "get");

        assert_eq!(counter.count("a:1", "get"), 2);
        assert_eq!(counter.count("a:1", "put"), 1);
        assert_eq!(counter.count("b:2", "get"), 1);

        let snap = counter.snapshot("/svc");
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].client, "a:1");
        assert_eq!(snap[0].service_name, "/svc");
        assert_eq!(
            snap[0].methods,
            vec![
                MethodCount { name: "get".into(), count: 2 },
                MethodCount { name: "put".into(), count: 1 },
            ]
        );
    }

    #[test]
    fn test_retain_clients_evicts_stale() {
        let counter = ClientCallCounter::new();
        counter.incr("a:1", "get");
        counter.incr("b:2", "get");

        let live: HashSet<String> = ["b:2".to_string()].into_iter().collect();
        assert_eq!(counter.retain_clients(&live), 1);
        assert_eq!(counter.clients(), vec!["b:2".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let counter = Arc::new(ClientCallCounter::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            tasks.push(tokio::spawn(async move {
                for _ in 0..500 {
                    counter.incr("10.0.0.1:5000", "get");
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(counter.count("10.0.0.1:5000", "get"), 16 * 500);
    }

    #[test]
    fn test_network_counters() {
        let net = NetworkCounters::new();
        net.record_read(100, 1);
        net.record_write(300, 2);
        net.connection_opened();
        net.connection_closed();
        net.connection_closed();

        let stat = net.snapshot();
        assert_eq!(stat.read_bytes, 100);
        assert_eq!(stat.read_count, 1);
        assert_eq!(stat.write_bytes, 300);
        assert_eq!(stat.write_count, 2);
        assert_eq!(stat.connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_publishes_each_interval() {
        let acc = Arc::new(CallAccounting::new());
        let net = Arc::new(NetworkCounters::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let monitor: Arc<dyn StatMonitor> = Arc::new(move |r: &StatReport| {
            sink.lock().unwrap().push(r.received);
        });
        let gauges: GaugeFn = Arc::new(|| Gauges {
            invoke_capacity: 4,
            ..Gauges::default()
        });
        let (tx, rx) = watch::channel(false);

        let handle = spawn_reporter(
            Arc::clone(&acc),
            net,
            Duration::from_secs(1),
            gauges,
            Some(monitor),
            rx,
        );

        acc.incr_received();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        acc.incr_received();
        acc.incr_received();
        tokio::time::sleep(Duration::from_secs(1)).await;

        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(acc.last_report().invoke_capacity, 4);
    }
}
