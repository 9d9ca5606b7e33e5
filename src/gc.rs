use std::{io, path::Path, sync::{Arc, atomic::{AtomicBool, Ordering}}};

use tokio::{fs::File, io::{AsyncWriteExt, BufWriter}, sync::{mpsc, oneshot}};

use crate::{error::DecodeError, models::{GcEvent, GcKind, GcPhase}, process_stat::epoch_ms};


enum Message {
    Event(GcEvent),
    End(oneshot::Sender<io::Result<u64>>),
}

/// Records collector cycles of the instrumented process as JSON lines.
///
/// Recording never blocks: events go through a channel to a writer task
/// that owns the file, so emission order is file order.
#[derive(Clone)]
pub struct GcRecorder {
    tx: mpsc::UnboundedSender<Message>,
    ended: Arc<AtomicBool>,
}

impl GcRecorder {
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path.as_ref()).await?;
        Ok(Self::start(file))
    }

    pub fn start(file: File) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_events(BufWriter::new(file), rx));

        Self { tx, ended: Arc::new(AtomicBool::new(false)) }
    }

    pub fn record(&self, kind: GcKind, phase: GcPhase) {
        let event = GcEvent { timestamp: epoch_ms(), kind, phase };
        if self.tx.send(Message::Event(event)).is_err() {
            tracing::trace!("GC event after end of stream dropped: {:?}", event);
        }
    }

    /// Records BEGIN now and END when the returned guard drops.
    pub fn begin(&self, kind: GcKind) -> GcCycle {
        self.record(kind, GcPhase::Begin);
        GcCycle { recorder: self.clone(), kind }
    }

    /// Flushes and syncs the event file. Returns the number of events
    /// written, or `None` if the stream was already ended.
    pub async fn end(&self) -> io::Result<Option<u64>> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        let (reply, done) = oneshot::channel();
        if self.tx.send(Message::End(reply)).is_err() {
            return Err(io::Error::other("gc event writer stopped"));
        }

        match done.await {
            Ok(result) => result.map(Some),
            Err(_) => Err(io::Error::other("gc event writer stopped")),
        }
    }
}

pub struct GcCycle {
    recorder: GcRecorder,
    kind: GcKind,
}

impl GcCycle {
    pub fn kind(&self) -> GcKind {
        self.kind
    }
}

impl Drop for GcCycle {
    fn drop(&mut self) {
        self.recorder.record(self.kind, GcPhase::End);
    }
}

async fn write_events(mut writer: BufWriter<File>, mut rx: mpsc::UnboundedReceiver<Message>) {
    let mut written = 0u64;
    let mut failure: Option<io::Error> = None;

    while let Some(message) = rx.recv().await {
        match message {
            Message::Event(event) => {
                if failure.is_some() {
                    continue;
                }
                if let Err(err) = write_line(&mut writer, &event).await {
                    tracing::error!("Failed to write GC event: {}", err);
                    failure = Some(err);
                    continue;
                }
                written += 1;
                if rx.is_empty() {
                    if let Err(err) = writer.flush().await {
                        failure = Some(err);
                    }
                }
            }
            Message::End(reply) => {
                let result = match failure.take() {
                    Some(err) => Err(err),
                    None => finish(&mut writer).await.map(|_| written),
                };
                let _ = reply.send(result);
                break;
            }
        }
    }
}

async fn write_line(writer: &mut BufWriter<File>, event: &GcEvent) -> io::Result<()> {
    let mut line = sonic_rs::to_string(event).map_err(io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

async fn finish(writer: &mut BufWriter<File>) -> io::Result<()> {
    writer.flush().await?;
    writer.get_mut().sync_all().await
}


/// Splits a byte stream into complete JSON lines. A partial last line is
/// held until the rest arrives.
pub struct GcLineDecoder {
    buffer: Vec<u8>,
    offset: usize,
}

impl GcLineDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new(), offset: 0 }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn next_event(&mut self) -> Option<Result<GcEvent, DecodeError>> {
        loop {
            let rest = &self.buffer[self.offset..];
            let newline = rest.iter().position(|b| *b == b'\n')?;
            let line = &rest[..newline];
            self.offset += newline + 1;

            let line = String::from_utf8_lossy(line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return Some(
                sonic_rs::from_str::<GcEvent>(line).map_err(|e| DecodeError::BadEvent(format!("{e}: {line}"))),
            );
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len() - self.offset
    }

    pub fn compact(&mut self) {
        if self.offset > 0 {
            self.buffer.drain(0..self.offset);
            self.offset = 0;
        }
    }
}

impl Default for GcLineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn read_gc_file(path: impl AsRef<Path>) -> Result<Vec<GcEvent>, DecodeError> {
    let bytes = tokio::fs::read(path.as_ref()).await?;
    let mut decoder = GcLineDecoder::new();
    decoder.feed(&bytes);

    let mut events = Vec::new();
    while let Some(event) = decoder.next_event() {
        events.push(event?);
    }
    Ok(events)
}
