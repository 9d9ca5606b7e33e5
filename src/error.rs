use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;


#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid sample interval {0:?}: expected a positive integer number of milliseconds")]
    InvalidSampleInterval(String),

    #[error("data path {path:?} is not writable: {source}")]
    UnwritableDataPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("write after end of stream")]
    Ended,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown record tag {tag:#04x} at byte {offset}")]
    UnknownTag { tag: u8, offset: u64 },

    #[error("implausible record length {len} at byte {offset}")]
    BadLength { len: usize, offset: u64 },

    #[error("malformed gc event line: {0}")]
    BadEvent(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sampler task failed: {0}")]
    Task(String),

    #[error("shutdown failed: {0}")]
    Shutdown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("failed to start {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("target exited with {0} before its probe was ready")]
    ExitedBeforeReady(ExitStatus),

    #[error("target probe not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[error("target failed with {0}")]
    TargetFailed(ExitStatus),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("collector task failed: {0}")]
    Task(String),
}
