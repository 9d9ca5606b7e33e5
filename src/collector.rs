use std::{ffi::OsString, path::{Path, PathBuf}, process::{ExitStatus, Stdio}, time::Duration};

use tokio::{
    fs::{self, File},
    io::AsyncReadExt,
    process::{Child, Command},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, sleep},
};

use crate::{
    config::{DATA_PATH_ENV, SAMPLE_INTERVAL_ENV},
    encoder::StatDecoder,
    error::{CollectError, DecodeError},
    gc::GcLineDecoder,
    models::{GcEvent, StatSnapshot},
    probe::DataDir,
};


const CHUNK_SIZE: usize = 1024 * 8;
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);


#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
    /// Passed to the target as `DOCTOR_SAMPLE_INTERVAL`, the probe default
    /// applies when unset.
    pub sample_interval_ms: Option<u64>,
    pub data_path: PathBuf,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl CollectOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            sample_interval_ms: None,
            data_path: PathBuf::from("."),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn sample_interval_ms(mut self, ms: u64) -> Self {
        self.sample_interval_ms = Some(ms);
        self
    }

    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(DATA_PATH_ENV, &self.data_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(ms) = self.sample_interval_ms {
            command.env(SAMPLE_INTERVAL_ENV, ms.to_string());
        }
        command
    }
}


/// Resolves once the target has exited and both streams are drained into
/// their channels. Carries the single terminal error, if any.
pub struct Completion {
    task: JoinHandle<Result<ExitStatus, CollectError>>,
}

impl Completion {
    pub async fn wait(self) -> Result<ExitStatus, CollectError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(CollectError::Task(err.to_string())),
        }
    }
}

/// The two telemetry streams of one target process lifetime. They are
/// independent: neither is interleaved with the other, and each ends when
/// the target has exited and its file is read to the end.
pub struct Collected {
    pub pid: u32,
    pub data_dir: DataDir,
    pub gc_events: mpsc::UnboundedReceiver<GcEvent>,
    pub process_stats: mpsc::UnboundedReceiver<StatSnapshot>,
    pub completion: Completion,
}

#[derive(Debug)]
pub struct Collection {
    pub gc_events: Vec<GcEvent>,
    pub process_stats: Vec<StatSnapshot>,
    pub status: ExitStatus,
    pub source_warning: bool,
}

impl Collected {
    pub fn source_warning(&self) -> bool {
        self.data_dir.source_warning().exists()
    }

    /// Drains both streams concurrently, then waits for the outcome.
    pub async fn drain(self) -> Result<Collection, CollectError> {
        let source_warning = self.source_warning();
        let Collected { mut gc_events, mut process_stats, completion, .. } = self;

        let (gc_events, process_stats) = tokio::join!(
            async move {
                let mut out = Vec::new();
                while let Some(event) = gc_events.recv().await {
                    out.push(event);
                }
                out
            },
            async move {
                let mut out = Vec::new();
                while let Some(stat) = process_stats.recv().await {
                    out.push(stat);
                }
                out
            },
        );

        let status = completion.wait().await?;
        Ok(Collection { gc_events, process_stats, status, source_warning })
    }
}


pub struct Collector;

impl Collector {
    /// Spawns the target and returns its streams once its probe is ready.
    /// Fails without returning any stream if the target can't start, exits
    /// first, or stays unready past `ready_timeout`.
    pub async fn launch(options: CollectOptions) -> Result<Collected, CollectError> {
        fs::create_dir_all(&options.data_path).await?;

        let mut child = options.command().spawn().map_err(|source| CollectError::Spawn {
            program: options.program.display().to_string(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| CollectError::Task("target exited before its pid was known".to_string()))?;
        let data_dir = DataDir::for_pid(&options.data_path, pid);

        tracing::debug!(pid, "Waiting for probe in {}", data_dir.root().display());

        // channels exist before readiness so nothing written after it is missed
        let (gc_tx, gc_rx) = mpsc::unbounded_channel();
        let (stat_tx, stat_rx) = mpsc::unbounded_channel();

        if let Err(err) = wait_ready(&mut child, &data_dir, options.ready_timeout, options.poll_interval).await {
            tracing::warn!(pid, "Target never became ready: {}", err);
            let _ = child.kill().await;
            return Err(err);
        }

        tracing::info!(pid, "Target ready");

        let (stop_tx, stop_rx) = watch::channel(false);
        let stat_tail = tokio::spawn(tail(
            data_dir.processstat(),
            StatDecoder::new(),
            stat_tx,
            stop_rx.clone(),
            options.poll_interval,
        ));
        let gc_tail = tokio::spawn(tail(
            data_dir.gcevent(),
            GcLineDecoder::new(),
            gc_tx,
            stop_rx,
            options.poll_interval,
        ));

        let task = tokio::spawn(supervise(child, pid, stop_tx, stat_tail, gc_tail));

        Ok(Collected {
            pid,
            data_dir,
            gc_events: gc_rx,
            process_stats: stat_rx,
            completion: Completion { task },
        })
    }
}

async fn wait_ready(child: &mut Child, data_dir: &DataDir, timeout: Duration, poll: Duration) -> Result<(), CollectError> {
    let ready = data_dir.ready();
    let deadline = Instant::now() + timeout;

    loop {
        if is_ready(&ready).await {
            return Ok(());
        }

        if let Some(status) = child.try_wait()? {
            // it may have become ready and finished between the two checks
            if is_ready(&ready).await {
                return Ok(());
            }
            return Err(CollectError::ExitedBeforeReady(status));
        }

        if Instant::now() >= deadline {
            return Err(CollectError::ReadyTimeout(timeout));
        }

        sleep(poll).await;
    }
}

async fn is_ready(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn supervise(
    mut child: Child,
    pid: u32,
    stop: watch::Sender<bool>,
    stat_tail: JoinHandle<Result<u64, CollectError>>,
    gc_tail: JoinHandle<Result<u64, CollectError>>,
) -> Result<ExitStatus, CollectError> {
    let status = child.wait().await;

    // both tailers drain to EOF and close their channel
    let _ = stop.send(true);
    drop(stop);

    let stats = join_tail(stat_tail).await;
    let gc = join_tail(gc_tail).await;

    let status = status?;
    tracing::info!(pid, "Target exited with {}", status);

    let stats = stats?;
    let gc = gc?;
    tracing::debug!(pid, "Collected {} stat records and {} gc events", stats, gc);

    if !status.success() {
        return Err(CollectError::TargetFailed(status));
    }
    Ok(status)
}

async fn join_tail(task: JoinHandle<Result<u64, CollectError>>) -> Result<u64, CollectError> {
    match task.await {
        Ok(result) => result,
        Err(err) => Err(CollectError::Task(err.to_string())),
    }
}


/// Incremental decoder of one stream file format.
trait RecordDecoder: Send + 'static {
    type Item: Send + 'static;

    fn feed(&mut self, data: &[u8]);
    fn next_item(&mut self) -> Option<Result<Self::Item, DecodeError>>;
    fn pending(&self) -> usize;
    fn compact(&mut self);
}

impl RecordDecoder for StatDecoder {
    type Item = StatSnapshot;

    fn feed(&mut self, data: &[u8]) {
        StatDecoder::feed(self, data)
    }

    fn next_item(&mut self) -> Option<Result<StatSnapshot, DecodeError>> {
        self.next_record()
    }

    fn pending(&self) -> usize {
        StatDecoder::pending(self)
    }

    fn compact(&mut self) {
        StatDecoder::compact(self)
    }
}

impl RecordDecoder for GcLineDecoder {
    type Item = GcEvent;

    fn feed(&mut self, data: &[u8]) {
        GcLineDecoder::feed(self, data)
    }

    fn next_item(&mut self) -> Option<Result<GcEvent, DecodeError>> {
        self.next_event()
    }

    fn pending(&self) -> usize {
        GcLineDecoder::pending(self)
    }

    fn compact(&mut self) {
        GcLineDecoder::compact(self)
    }
}

/// Follows a file the target is still appending to. Once `stop` flips the
/// file is read to its end one last time and the sender is dropped.
async fn tail<D: RecordDecoder>(
    path: PathBuf,
    mut decoder: D,
    tx: mpsc::UnboundedSender<D::Item>,
    mut stop: watch::Receiver<bool>,
    poll: Duration,
) -> Result<u64, CollectError> {
    let mut file = File::open(&path).await?;
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;

    loop {
        // read the flag first: a drain that starts after exit sees every byte
        let stopping = *stop.borrow_and_update();

        loop {
            let bytes_read = file.read(&mut chunk).await?;
            if bytes_read == 0 {
                break;
            }

            decoder.feed(&chunk[..bytes_read]);
            while let Some(result) = decoder.next_item() {
                match result {
                    Ok(item) => {
                        sent += 1;
                        // a dropped receiver only means nobody is listening
                        let _ = tx.send(item);
                    }
                    Err(err) => tracing::warn!("Skipping undecodable data in {}: {}", path.display(), err),
                }
            }
            decoder.compact();
        }

        if stopping {
            if decoder.pending() > 0 {
                tracing::warn!(
                    "{} ends with {} bytes of a truncated record",
                    path.display(),
                    decoder.pending()
                );
            }
            return Ok(sent);
        }

        tokio::select! {
            _ = stop.changed() => {}
            _ = sleep(poll) => {}
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_carries_probe_environment() {
        use std::ffi::OsStr;

        let options = CollectOptions::new("/bin/true")
            .arg("idle")
            .sample_interval_ms(1)
            .data_path("/tmp/doctor")
            .env("EXTRA", "1");

        let command = options.command();
        let std = command.as_std();
        let envs: Vec<(&OsStr, Option<&OsStr>)> = std.get_envs().collect();
        assert!(envs.contains(&(OsStr::new(SAMPLE_INTERVAL_ENV), Some(OsStr::new("1")))));
        assert!(envs.contains(&(OsStr::new(DATA_PATH_ENV), Some(OsStr::new("/tmp/doctor")))));
        assert!(envs.contains(&(OsStr::new("EXTRA"), Some(OsStr::new("1")))));
        assert_eq!(std.get_args().collect::<Vec<_>>(), vec![OsStr::new("idle")]);
    }

    #[test]
    fn interval_is_left_to_the_probe_by_default() {
        let command = CollectOptions::new("/bin/true").command();
        assert!(command.as_std().get_envs().all(|(k, _)| k != std::ffi::OsStr::new(SAMPLE_INTERVAL_ENV)));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = CollectOptions::new("/definitely/not/a/program").data_path(dir.path());
        let err = Collector::launch(options).await.err().unwrap();
        assert!(matches!(err, CollectError::Spawn { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn exit_without_probe_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let options = CollectOptions::new("/bin/sh").args(["-c", "exit 3"]).data_path(dir.path());
        let err = Collector::launch(options).await.err().unwrap();
        match err {
            CollectError::ExitedBeforeReady(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_probe_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let options = CollectOptions::new("/bin/sh")
            .args(["-c", "sleep 5"])
            .data_path(dir.path())
            .ready_timeout(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = Collector::launch(options).await.err().unwrap();
        assert!(matches!(err, CollectError::ReadyTimeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn tail_follows_appends_until_stopped() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gcevent");
        let mut writer = File::create(&path).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(tail(path, GcLineDecoder::new(), tx, stop_rx, Duration::from_millis(5)));

        writer.write_all(b"{\"timestamp\":1,\"type\":\"SCAVENGE\",\"phase\":\"BEGIN\"}\n{\"timestamp\":2,").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().timestamp, 1);

        writer.write_all(b"\"type\":\"SCAVENGE\",\"phase\":\"END\"}\n").await.unwrap();
        writer.flush().await.unwrap();
        stop_tx.send(true).unwrap();

        assert_eq!(task.await.unwrap().unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap().timestamp, 2);
        assert!(rx.recv().await.is_none());
    }
}
