use std::path::PathBuf;
use std::time::Duration;

use crate::ranges::ExclusionTable;

pub const DEFAULT_PORT: u16 = 25565;

/// Beyond roughly 20k concurrent probes throughput stops improving.
pub const DEFAULT_WORKERS: usize = 10_000;

/// Largest packet the protocol can frame (a 3-byte VarInt length).
pub const MAX_PACKET_LEN: usize = (1 << 21) - 1;

pub const DATA_DIR_ENV: &str = "SLP_CENSUS_DATA_DIR";
pub const DEFAULT_DATA_DIR: &str = "./slp-data";

/// Settings for one scan run. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub port: u16,
    pub workers: usize,
    pub connect_timeout: Duration,
    /// Bounds the whole receive phase of one probe.
    pub read_timeout: Duration,
    /// Capacity of each of the job, result and error queues.
    pub queue_capacity: usize,
    pub max_packet_len: usize,
    pub exclusions: ExclusionTable,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(3),
            queue_capacity: 100,
            max_packet_len: MAX_PACKET_LEN,
            exclusions: ExclusionTable::reserved(),
        }
    }
}

impl ScanConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Worker count from the command line; anything that is not a positive integer
/// falls back to [`DEFAULT_WORKERS`].
pub fn parse_worker_count(arg: Option<&str>) -> usize {
    arg.and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_WORKERS)
}

/// Storage directory for the record store.
pub fn data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}
