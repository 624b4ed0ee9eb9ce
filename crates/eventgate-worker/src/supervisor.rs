//! Worker supervisor
//!
//! One drain loop per back-end source. The loop exits cleanly (code 0,
//! the process supervisor above re-launches) on any of: OS signal,
//! RSS at 85% of the configured memory cap, uptime cap, or a restart
//! flag file (consumed on exit). Cancellation takes effect between
//! deliveries: the batch in flight always completes its ACKs first.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use eventgate_queue::{BrokerConsumer, QueueError, StreamConsumer};

/// Memory restart threshold as a share of the configured cap.
const MEMORY_THRESHOLD: f64 = 0.85;

/// Idle backoff cap.
const MAX_IDLE_SLEEP: Duration = Duration::from_secs(10);

/// Empty batches tolerated before the backoff starts doubling.
const IDLE_GRACE_BATCHES: u32 = 10;

/// Events between aggregate stats log lines.
const STATS_EVERY: u64 = 1_000;

/// Drain loop tuning
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    /// Base sleep after an empty batch
    pub poll_sleep: Duration,
    /// Configured memory cap; the loop exits at 85% of this
    pub memory_cap_mb: u64,
    pub max_uptime: Duration,
    pub restart_flag: PathBuf,
    /// How often to run a pending-entry claim pass on stream sources
    pub claim_interval: Duration,
    /// Pending entries examined per claim pass
    pub claim_batch: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_sleep: Duration::from_secs(1),
            memory_cap_mb: 512,
            max_uptime: Duration::from_secs(6 * 60 * 60),
            restart_flag: PathBuf::from("/tmp/eventgate-worker.restart"),
            claim_interval: Duration::from_millis(30_000),
            claim_batch: 100,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_parse("WORKER_BATCH_SIZE", defaults.batch_size),
            poll_sleep: defaults.poll_sleep,
            memory_cap_mb: env_parse("WORKER_MEMORY_CAP_MB", defaults.memory_cap_mb),
            max_uptime: Duration::from_secs(env_parse(
                "WORKER_MAX_UPTIME_S",
                defaults.max_uptime.as_secs(),
            )),
            restart_flag: std::env::var("WORKER_RESTART_FLAG")
                .map(PathBuf::from)
                .unwrap_or(defaults.restart_flag),
            claim_interval: defaults.claim_interval,
            claim_batch: defaults.claim_batch,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_memory_cap_mb(mut self, cap: u64) -> Self {
        self.memory_cap_mb = cap;
        self
    }

    pub fn with_max_uptime(mut self, uptime: Duration) -> Self {
        self.max_uptime = uptime;
        self
    }

    pub fn with_restart_flag(mut self, path: impl Into<PathBuf>) -> Self {
        self.restart_flag = path.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Why the drain loop ended; every reason is a clean exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Signal,
    MemoryLimit,
    UptimeLimit,
    RestartFlag,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::MemoryLimit => write!(f, "memory_limit"),
            Self::UptimeLimit => write!(f, "uptime_limit"),
            Self::RestartFlag => write!(f, "restart_flag"),
        }
    }
}

/// A consumer the supervisor can drain
pub enum DrainSource {
    Broker(BrokerConsumer),
    Stream(StreamConsumer),
}

impl DrainSource {
    pub fn name(&self) -> String {
        match self {
            Self::Broker(consumer) => format!("broker:{}", consumer.queue()),
            Self::Stream(consumer) => format!("stream:{}", consumer.stream()),
        }
    }

    async fn drain_batch(&mut self, batch: usize, block: Duration) -> Result<usize, QueueError> {
        match self {
            Self::Broker(consumer) => consumer.drain_batch(batch, block).await,
            Self::Stream(consumer) => consumer.drain_batch(batch, block).await,
        }
    }

    /// Recover pending entries from crashed group members. Broker
    /// deliveries re-queue on their own, so only streams claim.
    async fn claim_pending(&self, limit: usize) -> Result<usize, QueueError> {
        match self {
            Self::Broker(_) => Ok(0),
            Self::Stream(consumer) => consumer.claim_pending(limit).await,
        }
    }
}

/// Runs one drain loop to its clean exit
pub struct Supervisor {
    config: WorkerConfig,
    memory: MemoryMonitor,
}

impl Supervisor {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            memory: MemoryMonitor::new(),
        }
    }

    pub async fn run(
        &mut self,
        mut source: DrainSource,
        mut shutdown: watch::Receiver<bool>,
    ) -> ExitReason {
        let source_name = source.name();
        let started = Instant::now();
        let mut drained_total: u64 = 0;
        let mut last_stats: u64 = 0;
        let mut consecutive_empty: u32 = 0;
        let mut idle_sleep = self.config.poll_sleep;
        let mut last_claim = Instant::now();

        info!(source = %source_name, "Drain loop started");

        loop {
            if let Some(reason) = self.exit_reason(&shutdown, started) {
                self.finish(&source_name, reason, drained_total, started).await;
                return reason;
            }

            if last_claim.elapsed() >= self.config.claim_interval {
                last_claim = Instant::now();
                match source.claim_pending(self.config.claim_batch).await {
                    Ok(0) => {}
                    Ok(claimed) => info!(source = %source_name, claimed, "Recovered pending entries"),
                    Err(e) => warn!(source = %source_name, error = %e, "Claim pass failed"),
                }
            }

            let drained = match source
                .drain_batch(self.config.batch_size, Duration::from_secs(1))
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    error!(source = %source_name, error = %e, "Drain error");
                    0
                }
            };
            drained_total += drained as u64;

            if drained == 0 {
                consecutive_empty += 1;
                idle_sleep = idle_backoff(self.config.poll_sleep, idle_sleep, consecutive_empty);
                // wake early on shutdown so the signal exit is prompt
                tokio::select! {
                    _ = tokio::time::sleep(idle_sleep) => {}
                    _ = shutdown.changed() => {}
                }
            } else {
                consecutive_empty = 0;
                idle_sleep = self.config.poll_sleep;
            }

            if drained_total - last_stats >= STATS_EVERY {
                last_stats = drained_total;
                let elapsed = started.elapsed().as_secs_f64();
                info!(
                    source = %source_name,
                    events = drained_total,
                    rate = format!("{:.1}/s", drained_total as f64 / elapsed.max(1.0)),
                    memory_mb = self.memory.rss_mb(),
                    "Drain stats"
                );
            }
        }
    }

    fn exit_reason(&mut self, shutdown: &watch::Receiver<bool>, started: Instant) -> Option<ExitReason> {
        if *shutdown.borrow() {
            return Some(ExitReason::Signal);
        }
        if memory_exceeded(self.memory.rss_mb(), self.config.memory_cap_mb) {
            return Some(ExitReason::MemoryLimit);
        }
        if started.elapsed() >= self.config.max_uptime {
            return Some(ExitReason::UptimeLimit);
        }
        if self.config.restart_flag.exists() {
            // consume the flag so the next incarnation starts clean
            if let Err(e) = std::fs::remove_file(&self.config.restart_flag) {
                warn!(error = %e, "Failed to remove restart flag");
            }
            return Some(ExitReason::RestartFlag);
        }
        None
    }

    async fn finish(
        &mut self,
        source_name: &str,
        reason: ExitReason,
        drained_total: u64,
        started: Instant,
    ) {
        info!(
            source = %source_name,
            reason = %reason,
            events = drained_total,
            uptime_s = started.elapsed().as_secs(),
            memory_mb = self.memory.rss_mb(),
            "Drain loop exiting"
        );
    }
}

/// 85% of the configured cap, not of system memory.
pub fn memory_exceeded(rss_mb: u64, cap_mb: u64) -> bool {
    cap_mb > 0 && rss_mb as f64 >= cap_mb as f64 * MEMORY_THRESHOLD
}

/// Backoff for empty batches: base sleep until the grace runs out,
/// then doubling, capped at [`MAX_IDLE_SLEEP`].
pub fn idle_backoff(base: Duration, current: Duration, consecutive_empty: u32) -> Duration {
    if consecutive_empty <= IDLE_GRACE_BATCHES {
        base
    } else {
        (current * 2).min(MAX_IDLE_SLEEP)
    }
}

/// RSS sampling for the memory-cap rule
pub struct MemoryMonitor {
    system: System,
    pid: Pid,
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    pub fn rss_mb(&mut self) -> u64 {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system
            .process(self.pid)
            .map(|p| p.memory() / (1024 * 1024))
            .unwrap_or(0)
    }
}

/// Watch channel flipped by SIGTERM/SIGINT/SIGHUP.
pub fn shutdown_channel() -> std::io::Result<watch::Receiver<bool>> {
    use tokio::signal::unix::{signal, SignalKind};

    let (tx, rx) = watch::channel(false);
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => debug!("SIGTERM received"),
            _ = int.recv() => debug!("SIGINT received"),
            _ = hup.recv() => debug!("SIGHUP received"),
        }
        let _ = tx.send(true);
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_threshold() {
        assert!(!memory_exceeded(400, 512));
        assert!(!memory_exceeded(434, 512)); // 434 < 435.2
        assert!(memory_exceeded(436, 512));
        assert!(memory_exceeded(512, 512));
        // unset cap never trips
        assert!(!memory_exceeded(10_000, 0));
    }

    #[test]
    fn test_idle_backoff_grace_then_doubling() {
        let base = Duration::from_secs(1);
        let mut sleep = base;
        for empty in 1..=10 {
            sleep = idle_backoff(base, sleep, empty);
            assert_eq!(sleep, base, "still in grace at {empty}");
        }
        sleep = idle_backoff(base, sleep, 11);
        assert_eq!(sleep, Duration::from_secs(2));
        sleep = idle_backoff(base, sleep, 12);
        assert_eq!(sleep, Duration::from_secs(4));
        sleep = idle_backoff(base, sleep, 13);
        assert_eq!(sleep, Duration::from_secs(8));
        sleep = idle_backoff(base, sleep, 14);
        assert_eq!(sleep, Duration::from_secs(10));
        sleep = idle_backoff(base, sleep, 15);
        assert_eq!(sleep, Duration::from_secs(10), "capped");
    }

    #[test]
    fn test_restart_flag_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("restart");
        std::fs::write(&flag, b"").unwrap();

        let config = WorkerConfig::default().with_restart_flag(&flag);
        let mut supervisor = Supervisor::new(config);
        let (_tx, rx) = watch::channel(false);

        let reason = supervisor.exit_reason(&rx, Instant::now());
        assert_eq!(reason, Some(ExitReason::RestartFlag));
        assert!(!flag.exists(), "flag file is consumed");
    }

    #[test]
    fn test_signal_exit_reason() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig::default()
            .with_restart_flag(dir.path().join("restart"))
            .with_memory_cap_mb(0);
        let mut supervisor = Supervisor::new(config);

        let (tx, rx) = watch::channel(false);
        assert_eq!(supervisor.exit_reason(&rx, Instant::now()), None);

        tx.send(true).unwrap();
        assert_eq!(
            supervisor.exit_reason(&rx, Instant::now()),
            Some(ExitReason::Signal)
        );
    }

    #[test]
    fn test_uptime_exit_reason() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig::default()
            .with_restart_flag(dir.path().join("restart"))
            .with_memory_cap_mb(0)
            .with_max_uptime(Duration::from_millis(1));
        let mut supervisor = Supervisor::new(config);
        let (_tx, rx) = watch::channel(false);

        let long_ago = Instant::now() - Duration::from_secs(1);
        assert_eq!(
            supervisor.exit_reason(&rx, long_ago),
            Some(ExitReason::UptimeLimit)
        );
    }
}
