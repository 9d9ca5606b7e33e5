// Probe-enabled demo target, used by the collector's integration tests.
// Usage: doctor-workload <workload> [duration_ms]

use std::{fs::File, sync::Arc, time::{Duration, Instant}};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::time::{interval, sleep};

use proc_doctor::{config::Config, gc::GcRecorder, logging, models::GcKind, probe::Probe};


#[derive(Debug, Clone, Copy)]
enum WorkloadType {
    Idle,          // Nothing but a timer
    GcChurn,       // Allocation churn with scavenges and two full collections
    Spin,          // Busy CPU
    Handles,       // Holds many open descriptors
    Crash,         // Exits non-zero after the probe is ready
    WaitForSignal, // Idles until interrupted
}

impl WorkloadType {
    fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Some(WorkloadType::Idle),
            "gc-churn" | "gc_churn" | "gc" => Some(WorkloadType::GcChurn),
            "spin" | "cpu" => Some(WorkloadType::Spin),
            "handles" | "io" => Some(WorkloadType::Handles),
            "crash" => Some(WorkloadType::Crash),
            "wait-for-signal" | "wait" => Some(WorkloadType::WaitForSignal),
            _ => None,
        }
    }

    fn description(&self) -> &str {
        match self {
            WorkloadType::Idle => "IDLE: single timer, no allocation pressure",
            WorkloadType::GcChurn => "GC-CHURN: allocate and drop, then force two full collections",
            WorkloadType::Spin => "SPIN: busy loop on the runtime thread",
            WorkloadType::Handles => "HANDLES: keep descriptors open",
            WorkloadType::Crash => "CRASH: exit with status 2",
            WorkloadType::WaitForSignal => "WAIT: idle until SIGINT",
        }
    }

    fn default_duration(&self) -> Duration {
        match self {
            WorkloadType::WaitForSignal => Duration::from_secs(30),
            _ => Duration::from_millis(200),
        }
    }
}


/// Two-generation heap that reports its collections the way a managed
/// runtime would.
struct ToyHeap {
    young: Vec<Box<DateTime<Utc>>>,
    old: Vec<Box<DateTime<Utc>>>,
    young_limit: usize,
    gc: GcRecorder,
}

impl ToyHeap {
    fn new(gc: GcRecorder, young_limit: usize) -> Self {
        Self { young: Vec::with_capacity(young_limit), old: Vec::new(), young_limit, gc }
    }

    fn allocate(&mut self, count: usize) {
        for _ in 0..count {
            if self.young.len() >= self.young_limit {
                self.scavenge();
            }
            self.young.push(Box::new(Utc::now()));
        }
    }

    /// Drops tenured objects. The young generation only empties through
    /// scavenges.
    fn release(&mut self, count: usize) {
        let keep = self.old.len().saturating_sub(count);
        self.old.truncate(keep);
    }

    /// Promotes survivors of the young generation, dropping a random share.
    fn scavenge(&mut self) {
        let _cycle = self.gc.begin(GcKind::Scavenge);
        let survivors = self.young.drain(..).filter(|_| fastrand::u8(..) < 64);
        self.old.extend(survivors);
    }

    fn full_collect(&mut self) {
        let _cycle = self.gc.begin(GcKind::MarkSweepCompact);
        self.young.clear();
        self.old.clear();
        self.old.shrink_to_fit();
    }
}


async fn run_gc_churn(probe: &Probe, duration: Duration) {
    let mut heap = ToyHeap::new(probe.gc().clone(), 1024);
    let mut pushes = interval(Duration::from_millis(20));
    let mut pops = interval(Duration::from_millis(1));
    let deadline = sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = pushes.tick() => heap.allocate(2000),
            _ = pops.tick() => heap.release(500),
        }
    }

    heap.full_collect();
    heap.full_collect();
}

async fn run_spin(duration: Duration) {
    let start = Instant::now();
    let mut acc = 0u64;
    while start.elapsed() < duration {
        for i in 0..10_000u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        std::hint::black_box(acc);
        // let the sampler in now and then
        tokio::task::yield_now().await;
    }
}

async fn run_handles(duration: Duration) -> anyhow::Result<()> {
    let mut open = Vec::with_capacity(256);
    for _ in 0..256 {
        open.push(File::open("/dev/null").context("Failed to open /dev/null")?);
    }
    sleep(duration).await;
    drop(open);
    Ok(())
}

async fn run_workload(workload: WorkloadType, duration: Duration, probe: Arc<Probe>) -> i32 {
    tracing::info!("Running {} for {:?}", workload.description(), duration);

    match workload {
        WorkloadType::Idle | WorkloadType::WaitForSignal => sleep(duration).await,
        WorkloadType::GcChurn => run_gc_churn(&probe, duration).await,
        WorkloadType::Spin => run_spin(duration).await,
        WorkloadType::Handles => {
            if let Err(err) = run_handles(duration).await {
                tracing::error!("{:#}", err);
                return 1;
            }
        }
        WorkloadType::Crash => {
            sleep(duration).await;
            return 2;
        }
    }
    0
}


#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    logging::init("warn");

    let args: Vec<String> = std::env::args().collect();
    let workload = args
        .get(1)
        .and_then(|s| WorkloadType::from_str(s))
        .unwrap_or(WorkloadType::Idle);
    let duration = args
        .get(2)
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| workload.default_duration());

    let config = Config::from_env().context("Invalid probe configuration")?;

    Probe::run(config, |probe| run_workload(workload, duration, probe))
        .await
        .context("Probe failed")?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use proc_doctor::gc::read_gc_file;

    use super::*;

    #[tokio::test]
    async fn releases_never_starve_the_young_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gcevent");
        let gc = GcRecorder::create(&path).await.unwrap();

        let mut heap = ToyHeap::new(gc.clone(), 1024);
        for _ in 0..3 {
            heap.allocate(2000);
            for _ in 0..20 {
                heap.release(500);
            }
        }
        heap.full_collect();
        heap.full_collect();
        gc.end().await.unwrap();

        let events = read_gc_file(&path).await.unwrap();
        let count = |kind| events.iter().filter(|e| e.kind == kind).count();
        assert_eq!(count(GcKind::Scavenge), 10);
        assert_eq!(count(GcKind::MarkSweepCompact), 4);
    }
}
