use std::{future::Future, io, sync::{Arc, atomic::{AtomicBool, Ordering}}, time::Duration};

use tokio::{fs::File, io::AsyncWrite, sync::{Mutex, Notify}, task::JoinHandle};

use crate::{encoder::StatEncoder, error::{ConfigError, EncodeError, ProbeError}, process_stat::StatSource};


/// Sink that can confirm its bytes reached durable storage.
pub trait DurableSink: AsyncWrite + Unpin + Send + 'static {
    fn sync(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

impl DurableSink for File {
    async fn sync(&mut self) -> io::Result<()> {
        self.sync_all().await
    }
}

impl DurableSink for Vec<u8> {
    async fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerReport {
    pub records: u64,
}

pub struct Sampler<S, W> {
    source: S,
    encoder: StatEncoder<W>,
    interval: Duration,
}

impl<S: StatSource, W: DurableSink> Sampler<S, W> {
    pub fn new(source: S, sink: W, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidSampleInterval(format!("{}", interval.as_millis())));
        }

        Ok(Self { source, encoder: StatEncoder::new(sink), interval })
    }

    /// Spawns the sampling task. The first sample is taken on a later
    /// scheduler tick, never inside this call.
    pub fn start(self) -> SamplerHandle {
        let signals = Arc::new(Signals::default());
        let task = tokio::spawn(self.run(signals.clone()));

        SamplerHandle {
            signals,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(mut self, signals: Arc<Signals>) -> Result<SamplerReport, ProbeError> {
        tokio::task::yield_now().await;
        self.source.refresh();

        tracing::debug!("Sampler started with {:?} interval", self.interval);

        let outcome: Result<(), EncodeError> = loop {
            tokio::select! {
                biased;
                _ = signals.stop.notified() => break Ok(()),
                _ = tokio::time::sleep(self.interval) => {
                    let sample = self.source.sample();
                    if let Err(err) = self.save(&sample).await {
                        break Err(err);
                    }
                    self.source.refresh();
                }
            }
        };

        if let Err(err) = outcome {
            tracing::error!("Stat sink failed, sampling stopped: {}", err);
            signals.failed.store(true, Ordering::SeqCst);
            signals.failure.notify_one();
            return Err(err.into());
        }

        let records = self.encoder.records_written();
        let mut sink = self.encoder.end().await?;
        sink.sync().await?;

        tracing::debug!("Sampler flushed {} records", records);
        Ok(SamplerReport { records })
    }

    async fn save(&mut self, sample: &crate::models::StatSnapshot) -> Result<(), EncodeError> {
        self.encoder.write(sample).await?;
        self.encoder.flush().await
    }
}


#[derive(Default)]
struct Signals {
    shutting_down: AtomicBool,
    stop: Notify,
    failed: AtomicBool,
    failure: Notify,
}

#[derive(Clone)]
pub struct SamplerHandle {
    signals: Arc<Signals>,
    task: Arc<Mutex<Option<JoinHandle<Result<SamplerReport, ProbeError>>>>>,
}

impl SamplerHandle {
    /// Stops the timer, ends the stream and waits for the sink to sync.
    ///
    /// Only the first call does the work and gets `Some(report)`; every later
    /// or concurrent call returns `Ok(None)` straight away.
    pub async fn shutdown(&self) -> Result<Option<SamplerReport>, ProbeError> {
        if self.signals.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        self.signals.stop.notify_one();

        let Some(task) = self.task.lock().await.take() else {
            return Ok(None);
        };

        match task.await {
            Ok(result) => result.map(Some),
            Err(err) => Err(ProbeError::Task(err.to_string())),
        }
    }

    /// Resolves once sampling stopped on a sink error. Meant for a single
    /// watcher.
    pub async fn failed(&self) {
        if self.signals.failed.load(Ordering::SeqCst) {
            return;
        }
        self.signals.failure.notified().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.signals.shutting_down.load(Ordering::SeqCst)
    }
}
