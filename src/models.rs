use std::fmt;

use serde::{Deserialize, Serialize};


#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub rss: u64,
    pub heap_total: u64,
    pub heap_used: u64,
    pub external: u64,
}

/// One point-in-time reading of the sampled process.
///
/// `timestamp` is wall clock milliseconds, `delay` is the scheduling lag in
/// milliseconds observed since the previous refresh of the source.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub timestamp: u64,
    pub cpu: f64,
    pub memory: MemoryUsage,
    pub handles: u64,
    pub delay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GcKind {
    Scavenge,
    MarkSweepCompact,
    IncrementalMarking,
    ProcessWeakCallbacks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GcPhase {
    Begin,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcEvent {
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: GcKind,
    pub phase: GcPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryIssues {
    pub external: bool,
    pub rss: bool,
    pub heap_total: bool,
    pub heap_used: bool,
}

impl MemoryIssues {
    pub fn any(&self) -> bool {
        self.external || self.rss || self.heap_total || self.heap_used
    }
}

/// Which symptoms exceeded their thresholds over an analysed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IssuePresence {
    pub memory: MemoryIssues,
    pub cpu: bool,
    pub handles: bool,
    pub delay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Gc,
    EventLoop,
    Io,
    None,
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Gc => "gc",
            Category::EventLoop => "event-loop",
            Category::Io => "io",
            Category::None => "none",
            Category::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_event_uses_wire_names() {
        let event = GcEvent { timestamp: 12, kind: GcKind::MarkSweepCompact, phase: GcPhase::Begin };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"timestamp":12,"type":"MARK_SWEEP_COMPACT","phase":"BEGIN"}"#);

        let back: GcEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn snapshot_memory_is_camel_case() {
        let snapshot = StatSnapshot { memory: MemoryUsage { heap_total: 4, ..Default::default() }, ..Default::default() };
        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["memory"]["heapTotal"], 4);
        assert_eq!(json["memory"]["heapUsed"], 0);
    }

    #[test]
    fn category_serializes_like_display() {
        for category in [Category::Gc, Category::EventLoop, Category::Io, Category::None, Category::Unknown] {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{category}\""));
        }
    }
}
