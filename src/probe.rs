use std::{future::Future, io, path::{Path, PathBuf}, process, sync::Arc};

use tokio::{fs, signal::unix::{SignalKind, signal}, sync::OnceCell};

use crate::{
    config::Config,
    error::{ConfigError, ProbeError},
    gc::GcRecorder,
    process_stat::ProcStat,
    sampler::{Sampler, SamplerHandle},
    source_check,
};


/// Where one instrumented process keeps its artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn for_pid(base: &Path, pid: u32) -> Self {
        Self { root: base.join(format!("{pid}.doctor")) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn processstat(&self) -> PathBuf {
        self.root.join("processstat")
    }

    pub fn gcevent(&self) -> PathBuf {
        self.root.join("gcevent")
    }

    pub fn ready(&self) -> PathBuf {
        self.root.join("ready")
    }

    pub fn source_warning(&self) -> PathBuf {
        self.root.join("source_warning")
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stat_records: u64,
    pub gc_events: u64,
}

/// In-process instrumentation: stat sampler, GC event stream, readiness
/// marker and the shutdown protocol.
pub struct Probe {
    config: Config,
    data_dir: DataDir,
    sampler: SamplerHandle,
    gc: GcRecorder,
    finished: OnceCell<Result<ShutdownReport, String>>,
}

fn unwritable(path: &Path) -> impl FnOnce(io::Error) -> ConfigError + '_ {
    move |source| ConfigError::UnwritableDataPath { path: path.to_path_buf(), source }
}

impl Probe {
    pub async fn install(config: Config) -> Result<Arc<Self>, ProbeError> {
        let interval = config.sample_interval();
        let data_dir = DataDir::for_pid(&config.data_path, process::id());

        fs::create_dir_all(data_dir.root()).await.map_err(unwritable(data_dir.root()))?;

        let stat_path = data_dir.processstat();
        let stat_file = fs::File::create(&stat_path).await.map_err(unwritable(&stat_path))?;
        let gc_path = data_dir.gcevent();
        let gc = GcRecorder::create(&gc_path).await.map_err(unwritable(&gc_path))?;

        let sampler = Sampler::new(ProcStat::new(interval), stat_file, interval)?.start();

        if let Some(entry) = &config.entry_source {
            if source_check::looks_transpiled(entry) == Some(true) {
                tracing::warn!(
                    "{} looks transpiled or minified, heap usage per function will be unreliable",
                    entry.display()
                );
                if let Err(err) = fs::write(data_dir.source_warning(), entry.to_string_lossy().as_bytes()).await {
                    tracing::debug!("Could not write source warning marker: {}", err);
                }
            }
        }

        let probe = Arc::new(Self {
            config,
            data_dir,
            sampler,
            gc,
            finished: OnceCell::new(),
        });

        // handlers go in before readiness is visible to a collector
        probe.watch_signals()?;

        let watcher = probe.clone();
        tokio::spawn(async move {
            let code = watcher.stop_on_sampler_failure().await;
            process::exit(code);
        });

        mark_ready(&probe.data_dir).await?;
        tracing::info!("Probe ready, writing to {}", probe.data_dir.root().display());

        Ok(probe)
    }

    pub fn gc(&self) -> &GcRecorder {
        &self.gc
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ends both streams exactly once. Concurrent callers wait for the
    /// first one and all see the same outcome.
    pub async fn shutdown(&self) -> Result<ShutdownReport, ProbeError> {
        self.finished
            .get_or_init(|| async {
                self.flush().await.map_err(|err| {
                    tracing::error!("Probe shutdown failed: {}", err);
                    err.to_string()
                })
            })
            .await
            .clone()
            .map_err(ProbeError::Shutdown)
    }

    async fn flush(&self) -> Result<ShutdownReport, ProbeError> {
        // the gc stream is ended even when sampling already failed
        let stats = self.sampler.shutdown().await;
        let gc = self.gc.end().await;
        let (stats, gc) = (stats?, gc?);

        let report = ShutdownReport {
            stat_records: stats.map(|r| r.records).unwrap_or(0),
            gc_events: gc.unwrap_or(0),
        };
        tracing::info!("Probe flushed {} stat records and {} gc events", report.stat_records, report.gc_events);
        Ok(report)
    }

    /// Waits for the sampler to fail, then flushes what is left. Returns the
    /// exit status the process must terminate with.
    async fn stop_on_sampler_failure(&self) -> i32 {
        self.sampler.failed().await;
        tracing::error!("Stat sampling failed, shutting the process down");
        if let Err(err) = self.shutdown().await {
            tracing::debug!("Shutdown after sampler failure: {}", err);
        }
        1
    }

    /// Flush everything, then terminate the process.
    pub async fn exit(&self, code: i32) {
        let code = match self.shutdown().await {
            Ok(_) => code,
            Err(_) => 1,
        };
        process::exit(code);
    }

    /// SIGINT runs the flush-and-exit sequence unless the host owns
    /// interrupt handling. SIGUSR1 and SIGUSR2 are swallowed so external
    /// tooling can poke the process without killing it.
    fn watch_signals(self: &Arc<Self>) -> io::Result<()> {
        if self.config.defer_interrupt {
            tracing::debug!("SIGINT left to the host");
        } else {
            let mut sigint = signal(SignalKind::interrupt())?;
            let probe = self.clone();
            tokio::spawn(async move {
                while sigint.recv().await.is_some() {
                    tracing::info!("Received SIGINT");
                    probe.exit(0).await;
                }
            });
        }

        for kind in [SignalKind::user_defined1(), SignalKind::user_defined2()] {
            let mut keep_alive = signal(kind)?;
            tokio::spawn(async move {
                while keep_alive.recv().await.is_some() {
                    tracing::trace!("Ignoring {:?}", kind);
                }
            });
        }

        Ok(())
    }

    /// Runs `work` under the probe and exits once it completes, the way a
    /// host process would at its natural end.
    pub async fn run<F>(config: Config, work: impl FnOnce(Arc<Self>) -> F) -> Result<(), ProbeError>
    where
        F: Future<Output = i32>,
    {
        let probe = Self::install(config).await?;
        let code = work(probe.clone()).await;
        probe.exit(code).await;
        Ok(())
    }
}

async fn mark_ready(data_dir: &DataDir) -> Result<(), ProbeError> {
    let ready = data_dir.ready();
    let staging = ready.with_extension("tmp");
    fs::write(&staging, format!("{}\n", process::id())).await?;
    fs::rename(&staging, &ready).await?;
    Ok(())
}
