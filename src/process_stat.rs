// Process counters for the sampler.
// Linux only: everything is read from /proc/self.
// - /proc/self/status: VmRSS, VmData, RssAnon, RssFile, RssShmem
// - /proc/self/stat: utime, stime (clock ticks)
// - /proc/self/fd: open descriptor count

use std::fs::{self, read_to_string};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::models::{MemoryUsage, StatSnapshot};


/// Source of stat snapshots driven by the sampler.
///
/// `refresh` resets whatever baseline `sample` computes deltas against
/// (CPU time, timer lag). The sampler is the only caller of either method.
pub trait StatSource: Send + 'static {
    fn sample(&mut self) -> StatSnapshot;
    fn refresh(&mut self);
}


#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct StatusMemory {
    rss_kb: u64,
    data_kb: u64,
    anon_kb: u64,
    file_kb: u64,
    shmem_kb: u64,
}

fn parse_status(status: &str) -> StatusMemory {
    let mut memory = StatusMemory::default();
    for line in status.lines() {
        let Some((key, rest)) = line.split_once(':') else { continue };
        let value = rest.split_whitespace().next().and_then(|v| v.parse().ok()).unwrap_or(0);
        match key {
            "VmRSS" => memory.rss_kb = value,
            "VmData" => memory.data_kb = value,
            "RssAnon" => memory.anon_kb = value,
            "RssFile" => memory.file_kb = value,
            "RssShmem" => memory.shmem_kb = value,
            _ => {}
        }
    }
    memory
}

/// utime + stime in clock ticks, fields 14 and 15 of /proc/<pid>/stat.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // comm can contain spaces and parens, split after the last ')'
    let end_paren = stat.rfind(')')?;
    let parts: Vec<&str> = stat[end_paren + 1..].split_whitespace().collect();
    // After comm: state(0) ppid pgrp session tty_nr tpgid flags minflt cminflt majflt cmajflt utime(11) stime(12)
    if parts.len() > 12 {
        let utime: u64 = parts[11].parse().ok()?;
        let stime: u64 = parts[12].parse().ok()?;
        return Some(utime + stime);
    }
    None
}

fn clock_ticks_per_second() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as f64 } else { 100.0 }
}

pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}


/// `StatSource` backed by /proc/self.
pub struct ProcStat {
    sample_interval: Duration,
    ticks_per_second: f64,
    last_refresh: Instant,
    last_cpu_ticks: u64,
}

impl ProcStat {
    pub fn new(sample_interval: Duration) -> Self {
        let mut stat = Self {
            sample_interval,
            ticks_per_second: clock_ticks_per_second(),
            last_refresh: Instant::now(),
            last_cpu_ticks: 0,
        };
        stat.refresh();
        stat
    }

    pub fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    fn read_cpu_ticks() -> u64 {
        read_to_string("/proc/self/stat")
            .ok()
            .and_then(|s| parse_cpu_ticks(&s))
            .unwrap_or(0)
    }

    fn read_memory() -> MemoryUsage {
        let status = read_to_string("/proc/self/status").map(|s| parse_status(&s)).unwrap_or_default();
        MemoryUsage {
            rss: status.rss_kb * 1024,
            heap_total: status.data_kb * 1024,
            heap_used: status.anon_kb * 1024,
            external: (status.file_kb + status.shmem_kb) * 1024,
        }
    }

    fn read_handles() -> u64 {
        fs::read_dir("/proc/self/fd")
            .map(|entries| entries.filter_map(|e| e.ok()).count() as u64)
            .unwrap_or(0)
    }
}

impl StatSource for ProcStat {
    fn sample(&mut self) -> StatSnapshot {
        let elapsed = self.last_refresh.elapsed();

        let cpu_ticks = Self::read_cpu_ticks();
        let used = cpu_ticks.saturating_sub(self.last_cpu_ticks) as f64 / self.ticks_per_second;
        let cpu = if elapsed.as_secs_f64() > 0.0 { used / elapsed.as_secs_f64() } else { 0.0 };

        let delay = elapsed.saturating_sub(self.sample_interval).as_secs_f64() * 1000.0;

        StatSnapshot {
            timestamp: epoch_ms(),
            cpu,
            memory: Self::read_memory(),
            handles: Self::read_handles(),
            delay,
        }
    }

    fn refresh(&mut self) {
        self.last_refresh = Instant::now();
        self.last_cpu_ticks = Self::read_cpu_ticks();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tworkload\nVmPeak:\t  10000 kB\nVmData:\t  2048 kB\nVmRSS:\t  1500 kB\nRssAnon:\t  1000 kB\nRssFile:\t   400 kB\nRssShmem:\t  100 kB\nThreads:\t4\n";

    #[test]
    fn parses_status_memory() {
        let memory = parse_status(STATUS);
        assert_eq!(memory, StatusMemory { rss_kb: 1500, data_kb: 2048, anon_kb: 1000, file_kb: 400, shmem_kb: 100 });
    }

    #[test]
    fn parses_cpu_ticks_with_awkward_comm() {
        let stat = "4242 (my (odd) prog) S 1 4242 4242 0 -1 4194304 120 0 0 0 37 5 0 0 20 0 1 0 100 1000 200";
        assert_eq!(parse_cpu_ticks(stat), Some(42));
        assert_eq!(parse_cpu_ticks("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn samples_the_current_process() {
        let mut stat = ProcStat::new(Duration::from_millis(10));
        let snapshot = stat.sample();
        assert!(snapshot.memory.rss > 0);
        assert!(snapshot.handles > 0);
        assert!(snapshot.delay >= 0.0);
        assert!(snapshot.cpu >= 0.0);
        assert!(snapshot.timestamp > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn delay_counts_only_the_overshoot() {
        let mut stat = ProcStat::new(Duration::from_secs(3600));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stat.sample().delay, 0.0);

        let mut stat = ProcStat::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(stat.sample().delay >= 15.0);
    }
}
