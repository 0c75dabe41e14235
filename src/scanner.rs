use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use ::time::{format_description::well_known, OffsetDateTime};

use crate::classify::classify;
use crate::config::ScanConfig;
use crate::ranges::{compute_allowed_ranges, count_addresses, enumerate};
use crate::session::Session;
use crate::store::{encode_record, record_key, ResultSink};
use crate::types::{ClassifiedResult, ScanError};

/// Log a progress line every this many dispatched targets.
const PROGRESS_EVERY: u64 = 1 << 20;

/// Counters shared between the feeder, the workers and the consumer.
#[derive(Clone, Debug, Default)]
pub struct ScanStats {
    pub dispatched: Arc<AtomicU64>,
    pub results: Arc<AtomicU64>,
    pub errors: Arc<AtomicU64>,
    pub suppressed: Arc<AtomicU64>,
}

impl ScanStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            results: self.results.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub results: u64,
    pub errors: u64,
    pub suppressed: u64,
}

/// Stops a running scan. Cloneable; calling it more than once is harmless.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    cancel: CancellationToken,
}

impl ShutdownHandle {
    pub fn request_shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("shutdown requested, draining workers");
        }
        self.cancel.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Worker pool driving one Server List Ping probe per target.
///
/// One feeder pushes targets into a bounded job queue, a dispatcher drains it into at most
/// `workers` concurrent probe tasks, and a single consumer persists results and reports
/// unexpected errors. Shutdown cancels every pending await, including in-flight connects
/// and reads.
pub struct Scanner {
    config: Arc<ScanConfig>,
    cancel: CancellationToken,
    stats: ScanStats,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            stats: ScanStats::new(),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn stats(&self) -> ScanStats {
        self.stats.clone()
    }

    /// Scan every public IPv4 address outside the configured exclusion table.
    pub async fn run<S>(&self, sink: S) -> S
    where
        S: ResultSink,
    {
        let allowed = compute_allowed_ranges(&self.config.exclusions);
        info!(
            "scanning {} addresses in {} ranges on port {}",
            count_addresses(&allowed),
            allowed.len(),
            self.config.port
        );
        self.run_targets(enumerate(allowed), sink).await
    }

    /// Scan the given targets on the configured port. Returns the sink once every
    /// result has been handed to it.
    pub async fn run_targets<I, S>(&self, targets: I, sink: S) -> S
    where
        I: IntoIterator<Item = Ipv4Addr>,
        I::IntoIter: Send + 'static,
        S: ResultSink,
    {
        let capacity = self.config.queue_capacity.max(1);
        let (jobs_tx, jobs_rx) = mpsc::channel::<Ipv4Addr>(capacity);
        let (results_tx, results_rx) = mpsc::channel::<ClassifiedResult>(capacity);
        let (errors_tx, errors_rx) = mpsc::channel::<ScanError>(capacity);

        let feeder = tokio::spawn(feed(
            targets.into_iter(),
            jobs_tx,
            self.cancel.clone(),
            self.stats.dispatched.clone(),
        ));

        let probes = dispatch(
            jobs_rx,
            self.config.clone(),
            results_tx,
            errors_tx,
            self.cancel.clone(),
            self.stats.clone(),
        );
        let drain = consume(results_rx, errors_rx, sink, self.stats.clone());
        let settle = async move {
            // Returns once every probe has finished and dropped its queue senders.
            probes.await;
            if let Err(e) = feeder.await {
                warn!("feeder task failed: {e}");
            }
        };

        let (sink, ()) = tokio::join!(drain, settle);
        let s = self.stats.snapshot();
        info!(
            "scan finished: {} dispatched, {} results, {} errors reported, {} suppressed",
            s.dispatched, s.results, s.errors, s.suppressed
        );
        sink
    }
}

async fn feed<I>(
    targets: I,
    jobs: mpsc::Sender<Ipv4Addr>,
    cancel: CancellationToken,
    dispatched: Arc<AtomicU64>,
) where
    I: Iterator<Item = Ipv4Addr>,
{
    for ip in targets {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("feeder stopped by shutdown");
                return;
            }
            sent = jobs.send(ip) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        let n = dispatched.fetch_add(1, Ordering::Relaxed) + 1;
        if n % PROGRESS_EVERY == 0 {
            info!("dispatched {n} targets, last {ip}");
        }
    }
    debug!("feeder exhausted its targets");
}

/// Sole consumer of the job queue. Each target is probed in its own task; a semaphore
/// keeps at most `workers` of them in flight.
async fn dispatch(
    mut jobs: mpsc::Receiver<Ipv4Addr>,
    config: Arc<ScanConfig>,
    results: mpsc::Sender<ClassifiedResult>,
    errors: mpsc::Sender<ScanError>,
    cancel: CancellationToken,
    stats: ScanStats,
) {
    let permits = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut in_flight = JoinSet::new();
    debug!("dispatching with {} workers", config.workers.max(1));

    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            ip = jobs.recv() => ip,
        };
        let Some(ip) = next else { break };

        in_flight.spawn(probe_target(
            SocketAddrV4::new(ip, config.port),
            config.clone(),
            results.clone(),
            errors.clone(),
            cancel.clone(),
            stats.suppressed.clone(),
            permit,
        ));
        while let Some(joined) = in_flight.try_join_next() {
            log_join_failure(joined);
        }
    }
    // Unblocks a feeder still waiting on a full queue.
    drop(jobs);

    while let Some(joined) = in_flight.join_next().await {
        log_join_failure(joined);
    }
    debug!("all probes finished");
}

fn log_join_failure(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!("probe task failed: {e}");
    }
}

async fn probe_target(
    target: SocketAddrV4,
    config: Arc<ScanConfig>,
    results: mpsc::Sender<ClassifiedResult>,
    errors: mpsc::Sender<ScanError>,
    cancel: CancellationToken,
    suppressed: Arc<AtomicU64>,
    permit: OwnedSemaphorePermit,
) {
    let _permit = permit;
    if cancel.is_cancelled() {
        return;
    }

    match Session::new(target, &config).probe(&cancel).await {
        Ok(status) => {
            let record = classify(status, target, OffsetDateTime::now_utc());
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = results.send(record) => {}
            }
        }
        Err(error) if error.is_expected_noise() => {
            suppressed.fetch_add(1, Ordering::Relaxed);
        }
        Err(error) => {
            let failure = ScanError {
                addr: target,
                error,
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = errors.send(failure) => {}
            }
        }
    }
}

/// Drain both queues until each is closed and empty.
async fn consume<S: ResultSink>(
    mut results: mpsc::Receiver<ClassifiedResult>,
    mut errors: mpsc::Receiver<ScanError>,
    mut sink: S,
    stats: ScanStats,
) -> S {
    let mut results_open = true;
    let mut errors_open = true;
    while results_open || errors_open {
        tokio::select! {
            record = results.recv(), if results_open => match record {
                Some(record) => {
                    stats.results.fetch_add(1, Ordering::Relaxed);
                    persist(&mut sink, &record);
                }
                None => results_open = false,
            },
            failure = errors.recv(), if errors_open => match failure {
                Some(failure) => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "{} (ip {}, port {})",
                        failure.error,
                        failure.addr.ip(),
                        failure.addr.port()
                    );
                }
                None => errors_open = false,
            },
        }
    }
    debug!("consumer drained");
    sink
}

/// Log a summary of `record` and write it to the sink. Failures are logged and dropped.
fn persist<S: ResultSink>(sink: &mut S, record: &ClassifiedResult) {
    let players = record
        .status
        .players
        .as_ref()
        .map(|p| format!("{}/{}", p.online, p.max))
        .unwrap_or_else(|| "?/?".to_string());
    info!(
        "result {} version {:?} players {} fake_sample={} online_mode={:?} at {}",
        record.addr,
        record.status.version.name,
        players,
        record.is_fake_sample,
        record.is_online_mode,
        record
            .time
            .format(&well_known::Rfc3339)
            .unwrap_or_else(|_| String::from("?")),
    );

    let value = match encode_record(record) {
        Ok(v) => v,
        Err(e) => {
            error!("failed to encode result for {}: {e}", record.addr);
            return;
        }
    };
    if let Err(e) = put_blocking(sink, &record_key(record), &value) {
        error!("failed to store result for {}: {e}", record.addr);
    }
}

/// Sinks may do blocking I/O. On a multi-threaded runtime the call is moved off the
/// async scheduler; a current-thread runtime has nowhere to move it.
fn put_blocking<S: ResultSink>(sink: &mut S, key: &[u8], value: &[u8]) -> io::Result<()> {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => task::block_in_place(|| sink.put(key, value)),
        _ => sink.put(key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_target_list_finishes() {
        let scanner = Scanner::new(ScanConfig::default().with_workers(4));
        let sink = scanner.run_targets(Vec::new(), MemoryStore::default()).await;
        assert!(sink.entries.is_empty());
        assert_eq!(scanner.stats().snapshot().dispatched, 0);
    }

    #[tokio::test]
    async fn closed_port_is_suppressed() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ScanConfig {
            port,
            connect_timeout: Duration::from_millis(500),
            ..ScanConfig::default()
        }
        .with_workers(2);
        let scanner = Scanner::new(config);
        let sink = scanner
            .run_targets(vec![Ipv4Addr::LOCALHOST; 3], MemoryStore::default())
            .await;

        assert!(sink.entries.is_empty());
        let s = scanner.stats().snapshot();
        assert_eq!(s.dispatched, 3);
        assert_eq!(s.suppressed, 3);
        assert_eq!(s.errors, 0);
    }

    #[tokio::test]
    async fn shutdown_before_run_processes_nothing() {
        let scanner = Scanner::new(ScanConfig::default().with_workers(2));
        let handle = scanner.shutdown_handle();
        handle.request_shutdown();
        handle.request_shutdown();
        assert!(handle.is_shutdown_requested());

        let sink = tokio::time::timeout(
            Duration::from_secs(5),
            scanner.run_targets(vec![Ipv4Addr::LOCALHOST; 1000], MemoryStore::default()),
        )
        .await
        .expect("scan returns after shutdown");
        assert!(sink.entries.is_empty());
        assert_eq!(scanner.stats().snapshot().dispatched, 0);
    }

    struct FailingSink;

    impl ResultSink for FailingSink {
        fn put(&mut self, _: &[u8], _: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::other("disk full"))
        }
    }

    /// Stands in for a disk that takes a while per write.
    struct SlowSink {
        entries: Vec<Vec<u8>>,
    }

    impl ResultSink for SlowSink {
        fn put(&mut self, key: &[u8], _: &[u8]) -> std::io::Result<()> {
            std::thread::sleep(Duration::from_millis(5));
            self.entries.push(key.to_vec());
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_sink_on_multi_thread_runtime() {
        let (results_tx, results_rx) = mpsc::channel(4);
        let (errors_tx, errors_rx) = mpsc::channel::<ScanError>(4);
        let stats = ScanStats::new();
        let producer = tokio::spawn(async move {
            for i in 0..10u8 {
                let record = classify(
                    Default::default(),
                    SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, i), 25565),
                    OffsetDateTime::now_utc(),
                );
                results_tx.send(record).await.unwrap();
            }
            drop(errors_tx);
        });

        let slow = SlowSink {
            entries: Vec::new(),
        };
        let sink = consume(results_rx, errors_rx, slow, stats.clone()).await;
        producer.await.unwrap();
        assert_eq!(sink.entries.len(), 10);
        assert_eq!(sink.entries[9][3], 9);
        assert_eq!(stats.snapshot().results, 10);
    }

    #[test]
    fn sink_is_called_directly_outside_a_runtime() {
        let mut sink = MemoryStore::default();
        put_blocking(&mut sink, b"k", b"v").unwrap();
        assert_eq!(sink.entries, vec![(b"k".to_vec(), b"v".to_vec())]);
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_the_consumer() {
        let (results_tx, results_rx) = mpsc::channel(4);
        let (errors_tx, errors_rx) = mpsc::channel::<ScanError>(4);
        let stats = ScanStats::new();
        let record = classify(
            Default::default(),
            SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 25565),
            OffsetDateTime::now_utc(),
        );
        results_tx.send(record.clone()).await.unwrap();
        results_tx.send(record).await.unwrap();
        drop(results_tx);
        drop(errors_tx);

        consume(results_rx, errors_rx, FailingSink, stats.clone()).await;
        assert_eq!(stats.snapshot().results, 2);
    }
}
