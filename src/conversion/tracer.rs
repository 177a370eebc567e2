//! Conversion tracer: diagnostic event log for conversions.
//!
//! Records start/end/step/error events into a bounded ring buffer (oldest
//! evicted first), accumulates per-operation timings from start/end pairs,
//! and exports the buffer as JSON, a Graphviz DOT graph, or indented text
//! with a performance summary.
//!
//! Diagnostics only: the state sits behind a `Mutex`, a poisoned lock is
//! recovered rather than reported, and nothing here affects conversion results.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::TracerConfig;

/// Distinct operation names tracked for open starts and timings.
pub const MAX_TIMED_OPERATIONS: usize = 64;

#[derive(Error, Debug)]
pub enum TracerError {
    #[error("Trace serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown export format '{0}' (expected json, dot or text)")]
    UnknownFormat(String),
}

// ──────────────────────────────────────────────
// Events
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventKind {
    Start,
    End,
    Step,
    Error,
}

impl TraceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Step => "step",
            Self::Error => "error",
        }
    }

    fn dot_color(&self) -> &'static str {
        match self {
            Self::Start => "lightblue",
            Self::End => "palegreen",
            Self::Step => "lightyellow",
            Self::Error => "lightcoral",
        }
    }
}

/// An event to record.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    pub description: String,
    pub data: Option<serde_json::Value>,
}

impl TraceEvent {
    pub fn start(description: impl Into<String>) -> Self {
        Self::new(TraceEventKind::Start, description, None)
    }

    pub fn end(description: impl Into<String>) -> Self {
        Self::new(TraceEventKind::End, description, None)
    }

    pub fn step(description: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(TraceEventKind::Step, description, Some(data))
    }

    pub fn error(description: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(TraceEventKind::Error, description, Some(data))
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    fn new(
        kind: TraceEventKind,
        description: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            kind,
            description: description.into(),
            data,
        }
    }
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub sequence: u64,
    pub kind: TraceEventKind,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    /// Set on `End` entries that closed a matching `Start`.
    pub duration_ms: Option<f64>,
    pub data: Option<serde_json::Value>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Dot,
    Text,
}

impl FromStr for ExportFormat {
    type Err = TracerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "dot" => Ok(Self::Dot),
            "text" => Ok(Self::Text),
            other => Err(TracerError::UnknownFormat(other.into())),
        }
    }
}

// ──────────────────────────────────────────────
// Performance summary
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Timing {
    count: u64,
    total_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl Timing {
    fn record(&mut self, ms: f64) {
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms += ms;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationStats {
    pub name: String,
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub operations: Vec<OperationStats>,
    pub overall_avg_ms: f64,
    /// Operations whose average exceeds half the overall average.
    pub bottlenecks: Vec<String>,
}

// ──────────────────────────────────────────────
// Tracer
// ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct TracerState {
    entries: VecDeque<TraceEntry>,
    /// Open `Start` instants per description (nested starts stack).
    open: HashMap<String, Vec<Instant>>,
    timings: BTreeMap<String, Timing>,
    next_sequence: u64,
}

#[derive(Debug)]
pub struct ConversionTracer {
    id: Uuid,
    config: TracerConfig,
    state: Mutex<TracerState>,
}

impl Default for ConversionTracer {
    fn default() -> Self {
        Self::new(TracerConfig::default())
    }
}

impl ConversionTracer {
    pub fn new(config: TracerConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            state: Mutex::new(TracerState::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.config.dry_run = dry_run;
    }

    fn lock(&self) -> MutexGuard<'_, TracerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an event. No-op while disabled.
    pub fn trace(&self, event: TraceEvent) {
        if !self.config.enabled {
            return;
        }
        let capacity = self.config.max_trace_entries.max(1);
        let mut state = self.lock();

        let duration_ms = match event.kind {
            TraceEventKind::Start => {
                let tracked = state.open.contains_key(&event.description)
                    || state.open.len() < MAX_TIMED_OPERATIONS;
                if tracked {
                    state
                        .open
                        .entry(event.description.clone())
                        .or_default()
                        .push(Instant::now());
                }
                None
            }
            TraceEventKind::End => {
                let started = match state.open.get_mut(&event.description) {
                    Some(stack) => {
                        let started = stack.pop();
                        if stack.is_empty() {
                            state.open.remove(&event.description);
                        }
                        started
                    }
                    None => None,
                };
                started.map(|instant| {
                    let ms = instant.elapsed().as_secs_f64() * 1000.0;
                    let known = state.timings.contains_key(&event.description);
                    if known || state.timings.len() < MAX_TIMED_OPERATIONS {
                        state
                            .timings
                            .entry(event.description.clone())
                            .or_default()
                            .record(ms);
                    }
                    ms
                })
            }
            TraceEventKind::Step | TraceEventKind::Error => None,
        };

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        while state.entries.len() >= capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(TraceEntry {
            sequence,
            kind: event.kind,
            description: event.description,
            timestamp: Utc::now(),
            duration_ms,
            data: event.data,
            dry_run: self.config.dry_run,
        });
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the buffer, oldest first.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.open.clear();
        state.timings.clear();
    }

    pub fn performance_summary(&self) -> PerformanceSummary {
        let timings = self.lock().timings.clone();
        summarize(&timings)
    }

    pub fn export(&self, format: ExportFormat) -> Result<String, TracerError> {
        let entries = self.entries();
        match format {
            ExportFormat::Json => self.export_json(&entries),
            ExportFormat::Dot => Ok(export_dot(&entries)),
            ExportFormat::Text => Ok(export_text(&entries, &self.performance_summary())),
        }
    }

    fn export_json(&self, entries: &[TraceEntry]) -> Result<String, TracerError> {
        let document = serde_json::json!({
            "tracer_id": self.id,
            "dry_run": self.config.dry_run,
            "entries": entries,
            "performance": self.performance_summary(),
        });
        Ok(serde_json::to_string_pretty(&document)?)
    }
}

fn summarize(timings: &BTreeMap<String, Timing>) -> PerformanceSummary {
    let operations: Vec<OperationStats> = timings
        .iter()
        .map(|(name, t)| OperationStats {
            name: name.clone(),
            count: t.count,
            avg_ms: t.total_ms / t.count as f64,
            min_ms: t.min_ms,
            max_ms: t.max_ms,
        })
        .collect();

    let total_count: u64 = timings.values().map(|t| t.count).sum();
    let total_ms: f64 = timings.values().map(|t| t.total_ms).sum();
    let overall_avg_ms = if total_count == 0 {
        0.0
    } else {
        total_ms / total_count as f64
    };

    let bottlenecks = operations
        .iter()
        .filter(|op| op.avg_ms > overall_avg_ms / 2.0)
        .map(|op| op.name.clone())
        .collect();

    PerformanceSummary {
        operations,
        overall_avg_ms,
        bottlenecks,
    }
}

fn export_dot(entries: &[TraceEntry]) -> String {
    let mut out = String::from("digraph ConversionTrace {\n");
    out.push_str("  rankdir=LR;\n  node [shape=box, style=filled];\n");

    for entry in entries {
        let _ = writeln!(
            out,
            "  n{} [label=\"{}: {}\", fillcolor=\"{}\"];",
            entry.sequence,
            entry.kind.as_str(),
            escape_dot(&entry.description),
            entry.kind.dot_color()
        );
    }
    for pair in entries.windows(2) {
        let elapsed = elapsed_ms(&pair[0].timestamp, &pair[1].timestamp);
        let _ = writeln!(
            out,
            "  n{} -> n{} [label=\"{elapsed:.3}ms\"];",
            pair[0].sequence, pair[1].sequence
        );
    }

    out.push_str("}\n");
    out
}

fn export_text(entries: &[TraceEntry], summary: &PerformanceSummary) -> String {
    let mut out = String::new();
    let mut depth: usize = 0;

    for entry in entries {
        if entry.kind == TraceEventKind::End {
            depth = depth.saturating_sub(1);
        }
        let indent = "  ".repeat(depth);
        let _ = write!(
            out,
            "{}[{}] {} {}",
            indent,
            entry.timestamp.format("%H:%M:%S%.3f"),
            entry.kind.as_str().to_uppercase(),
            entry.description
        );
        if let Some(ms) = entry.duration_ms {
            let _ = write!(out, " ({ms:.3}ms)");
        }
        if entry.dry_run {
            out.push_str(" [dry-run]");
        }
        out.push('\n');
        if entry.kind == TraceEventKind::Start {
            depth += 1;
        }
    }

    out.push_str("\nPerformance summary:\n");
    if summary.operations.is_empty() {
        out.push_str("  (no completed operations)\n");
        return out;
    }
    for op in &summary.operations {
        let _ = writeln!(
            out,
            "  {}: count={} avg={:.3}ms min={:.3}ms max={:.3}ms",
            op.name, op.count, op.avg_ms, op.min_ms, op.max_ms
        );
    }
    let _ = writeln!(out, "  overall avg={:.3}ms", summary.overall_avg_ms);
    if !summary.bottlenecks.is_empty() {
        let _ = writeln!(out, "  bottlenecks: {}", summary.bottlenecks.join(", "));
    }
    out
}

fn elapsed_ms(a: &DateTime<Utc>, b: &DateTime<Utc>) -> f64 {
    (*b - *a)
        .num_microseconds()
        .map(|us| us as f64 / 1000.0)
        .unwrap_or(0.0)
        .max(0.0)
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer(max: usize) -> ConversionTracer {
        ConversionTracer::new(TracerConfig {
            max_trace_entries: max,
            ..TracerConfig::default()
        })
    }

    fn inject_timing(tracer: &ConversionTracer, name: &str, samples: &[f64]) {
        let mut state = tracer.lock();
        let timing = state.timings.entry(name.into()).or_default();
        for ms in samples {
            timing.record(*ms);
        }
    }

    #[test]
    fn buffer_is_bounded_and_evicts_oldest() {
        let tracer = tracer(3);
        for i in 0..4 {
            tracer.trace(TraceEvent::step(format!("step {i}"), serde_json::json!({})));
        }
        let entries = tracer.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].description, "step 1");
        assert_eq!(entries[2].description, "step 3");
    }

    #[test]
    fn disabled_tracer_records_nothing() {
        let mut tracer = tracer(10);
        tracer.set_enabled(false);
        tracer.trace(TraceEvent::start("convert"));
        assert!(tracer.is_empty());
    }

    #[test]
    fn start_end_pair_records_duration() {
        let tracer = tracer(10);
        tracer.trace(TraceEvent::start("convert mg -> g"));
        tracer.trace(TraceEvent::end("convert mg -> g"));
        let entries = tracer.entries();
        assert!(entries[0].duration_ms.is_none());
        assert!(entries[1].duration_ms.is_some());

        let summary = tracer.performance_summary();
        assert_eq!(summary.operations.len(), 1);
        assert_eq!(summary.operations[0].count, 1);
    }

    #[test]
    fn unmatched_end_has_no_duration() {
        let tracer = tracer(10);
        tracer.trace(TraceEvent::end("orphan"));
        assert!(tracer.entries()[0].duration_ms.is_none());
        assert!(tracer.performance_summary().operations.is_empty());
    }

    #[test]
    fn dry_run_flags_entries() {
        let mut tracer = tracer(10);
        tracer.set_dry_run(true);
        tracer.trace(TraceEvent::start("convert"));
        assert!(tracer.entries()[0].dry_run);
    }

    #[test]
    fn summary_stats_and_bottlenecks() {
        let tracer = tracer(10);
        inject_timing(&tracer, "fast", &[1.0, 1.0, 1.0]);
        inject_timing(&tracer, "slow", &[9.0]);
        let summary = tracer.performance_summary();

        // overall = 12ms / 4 = 3ms; threshold 1.5ms
        assert!((summary.overall_avg_ms - 3.0).abs() < 1e-9);
        assert_eq!(summary.bottlenecks, vec!["slow"]);

        let slow = summary.operations.iter().find(|o| o.name == "slow").unwrap();
        assert_eq!(slow.min_ms, 9.0);
        assert_eq!(slow.max_ms, 9.0);
        let fast = summary.operations.iter().find(|o| o.name == "fast").unwrap();
        assert_eq!(fast.count, 3);
        assert!((fast.avg_ms - 1.0).abs() < 1e-9);
    }

    #[test]
    fn json_export_parses() {
        let tracer = tracer(10);
        tracer.trace(TraceEvent::start("convert"));
        tracer.trace(TraceEvent::step("dimensional", serde_json::json!({"factor": 0.001})));
        tracer.trace(TraceEvent::end("convert"));

        let json = tracer.export(ExportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["entries"].as_array().unwrap().len(), 3);
        assert_eq!(value["entries"][1]["kind"], "step");
        assert_eq!(value["entries"][1]["data"]["factor"], 0.001);
    }

    #[test]
    fn dot_export_has_nodes_edges_and_colors() {
        let tracer = tracer(10);
        tracer.trace(TraceEvent::start("convert \"x\""));
        tracer.trace(TraceEvent::error("convert \"x\"", serde_json::json!({})));
        let dot = tracer.export(ExportFormat::Dot).unwrap();
        assert!(dot.starts_with("digraph ConversionTrace {"));
        assert!(dot.contains("n0 [label=\"start: convert \\\"x\\\"\", fillcolor=\"lightblue\"]"));
        assert!(dot.contains("fillcolor=\"lightcoral\""));
        assert!(dot.contains("n0 -> n1"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn text_export_indents_and_summarizes() {
        let tracer = tracer(10);
        tracer.trace(TraceEvent::start("convert"));
        tracer.trace(TraceEvent::step("dimensional", serde_json::json!({})));
        tracer.trace(TraceEvent::end("convert"));
        let text = tracer.export(ExportFormat::Text).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].contains("START convert"));
        assert!(lines[1].starts_with("  ["));
        assert!(lines[1].contains("STEP dimensional"));
        assert!(!lines[2].starts_with(' '));
        assert!(text.contains("Performance summary:"));
        assert!(text.contains("convert: count=1"));
    }

    #[test]
    fn export_format_parses() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("dot".parse::<ExportFormat>().unwrap(), ExportFormat::Dot);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn timing_tables_stay_bounded() {
        let tracer = tracer(2);
        for i in 0..500 {
            let label = format!("op {i}");
            tracer.trace(TraceEvent::start(&label));
            tracer.trace(TraceEvent::end(&label));
        }
        assert_eq!(tracer.len(), 2);
        assert_eq!(tracer.performance_summary().operations.len(), MAX_TIMED_OPERATIONS);
        assert!(tracer.lock().open.is_empty());

        for i in 0..500 {
            tracer.trace(TraceEvent::start(format!("dangling {i}")));
        }
        assert_eq!(tracer.lock().open.len(), MAX_TIMED_OPERATIONS);
    }

    #[test]
    fn nested_starts_close_in_order() {
        let tracer = tracer(10);
        tracer.trace(TraceEvent::start("op"));
        tracer.trace(TraceEvent::start("op"));
        tracer.trace(TraceEvent::end("op"));
        assert_eq!(tracer.lock().open["op"].len(), 1);
        tracer.trace(TraceEvent::end("op"));
        assert!(tracer.lock().open.is_empty());
        assert_eq!(tracer.performance_summary().operations[0].count, 2);
    }

    #[test]
    fn clear_resets_everything() {
        let tracer = tracer(10);
        tracer.trace(TraceEvent::start("a"));
        tracer.trace(TraceEvent::end("a"));
        tracer.clear();
        assert!(tracer.is_empty());
        assert!(tracer.performance_summary().operations.is_empty());
    }

    #[test]
    fn summary_readable_from_other_threads() {
        let tracer = std::sync::Arc::new(tracer(100));
        let writer = {
            let tracer = std::sync::Arc::clone(&tracer);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    tracer.trace(TraceEvent::start("op"));
                    tracer.trace(TraceEvent::end("op"));
                }
            })
        };
        for _ in 0..50 {
            let _ = tracer.performance_summary();
        }
        writer.join().unwrap();
        assert_eq!(tracer.performance_summary().operations[0].count, 50);
    }
}
