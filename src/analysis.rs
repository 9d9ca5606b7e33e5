use std::collections::HashMap;

use serde::Serialize;
use tokio::io::AsyncRead;

use crate::{
    encoder::StatReader,
    error::DecodeError,
    models::{Category, GcEvent, GcKind, GcPhase, IssuePresence, StatSnapshot},
};


/// Maps detected symptoms to a bottleneck category.
///
/// The predicates are mutually exclusive and checked in order. Memory
/// pressure seen together with CPU or handle pressure is ambiguous and
/// falls through to `Unknown`, as does any other combination not listed.
pub fn classify(issues: &IssuePresence) -> Category {
    let memory = issues.memory.any();

    match (memory, issues.delay, issues.cpu || issues.handles) {
        (true, _, false) => Category::Gc,
        (false, true, false) => Category::EventLoop,
        (false, false, true) => Category::Io,
        (false, false, false) => Category::None,
        _ => Category::Unknown,
    }
}


#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct StatSummary {
    pub samples: u64,
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
    /// Mean gap between consecutive timestamps in ms.
    pub mean_spacing_ms: Option<f64>,
    pub mean_cpu: f64,
    pub max_rss: u64,
    pub max_heap_total: u64,
    pub max_heap_used: u64,
    pub max_external: u64,
    pub max_handles: u64,
    pub max_delay_ms: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub truncated_bytes: usize,
    /// Decode errors stepped over while reading.
    #[serde(skip_serializing_if = "is_zero")]
    pub undecodable: usize,
    #[serde(skip)]
    cpu_sum: f64,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl StatSummary {
    pub fn from_snapshots<'a>(snapshots: impl IntoIterator<Item = &'a StatSnapshot>) -> Self {
        let mut summary = Self::default();
        for snapshot in snapshots {
            summary.push(snapshot);
        }
        summary
    }

    /// Summarises a whole stat stream. Corrupt bytes are logged and skipped,
    /// only I/O errors end the read.
    pub async fn from_reader<R: AsyncRead + Unpin>(mut reader: StatReader<R>) -> Result<Self, DecodeError> {
        let mut summary = Self::default();
        loop {
            match reader.next().await {
                Ok(Some(snapshot)) => summary.push(&snapshot),
                Ok(None) => break,
                Err(DecodeError::Io(err)) => return Err(DecodeError::Io(err)),
                Err(err) => {
                    tracing::warn!("Skipping undecodable stat data: {}", err);
                    summary.undecodable += 1;
                }
            }
        }
        summary.truncated_bytes = reader.truncated_bytes();
        Ok(summary)
    }

    pub fn push(&mut self, snapshot: &StatSnapshot) {
        self.samples += 1;
        self.first_timestamp.get_or_insert(snapshot.timestamp);
        self.last_timestamp = Some(snapshot.timestamp);

        self.cpu_sum += snapshot.cpu;
        self.mean_cpu = self.cpu_sum / self.samples as f64;

        self.max_rss = self.max_rss.max(snapshot.memory.rss);
        self.max_heap_total = self.max_heap_total.max(snapshot.memory.heap_total);
        self.max_heap_used = self.max_heap_used.max(snapshot.memory.heap_used);
        self.max_external = self.max_external.max(snapshot.memory.external);
        self.max_handles = self.max_handles.max(snapshot.handles);
        self.max_delay_ms = self.max_delay_ms.max(snapshot.delay);

        // mean of successive differences telescopes to (last - first) / (n - 1)
        if let (Some(first), Some(last)) = (self.first_timestamp, self.last_timestamp) {
            if self.samples > 1 {
                self.mean_spacing_ms = Some((last as f64 - first as f64) / (self.samples - 1) as f64);
            }
        }
    }
}


#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct GcSummary {
    pub events: u64,
    pub per_kind: HashMap<GcKind, u64>,
    /// BEGIN immediately followed by END of the same kind, END not earlier.
    pub completed_cycles: HashMap<GcKind, u64>,
    /// Events that broke the BEGIN/END pairing.
    pub unpaired: u64,
}

impl GcSummary {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a GcEvent>) -> Self {
        let mut summary = Self::default();
        let mut open: Option<&GcEvent> = None;

        for event in events {
            summary.events += 1;
            *summary.per_kind.entry(event.kind).or_insert(0) += 1;

            match (event.phase, open.take()) {
                (GcPhase::Begin, previous) => {
                    if previous.is_some() {
                        summary.unpaired += 1;
                    }
                    open = Some(event);
                }
                (GcPhase::End, Some(begin)) if begin.kind == event.kind && begin.timestamp <= event.timestamp => {
                    *summary.completed_cycles.entry(event.kind).or_insert(0) += 1;
                }
                (GcPhase::End, Some(_)) => summary.unpaired += 2,
                (GcPhase::End, None) => summary.unpaired += 1,
            }
        }

        if open.is_some() {
            summary.unpaired += 1;
        }
        summary
    }

    pub fn count(&self, kind: GcKind) -> u64 {
        self.per_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn cycles(&self, kind: GcKind) -> u64 {
        self.completed_cycles.get(&kind).copied().unwrap_or(0)
    }
}
