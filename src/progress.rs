//! Extraction progress reporting.
//!
//! Reports observable progress during `harvest extract` so users see which
//! property is being processed, what each source returned, and how far the
//! run has got. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use crate::models::ImageSource;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Run accepted; `total` properties will be considered.
    RunStarted { total: u64 },
    PropertyStarted { address: String },
    /// A source was not queried or its call failed.
    SourceSkipped {
        address: String,
        source: ImageSource,
        reason: String,
    },
    /// A source returned `count` image URLs.
    ImagesDiscovered {
        address: String,
        source: ImageSource,
        count: u64,
    },
    /// Property done; `n` of `total` properties finished so far.
    PropertyFinished {
        address: String,
        outcome: &'static str,
        stored: u64,
        duplicates: u64,
        n: u64,
        total: u64,
    },
    /// More new images than the configured threshold were stored this run.
    LargeBatch { count: u64, threshold: u64 },
}

/// Reports extraction progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from orchestrator workers.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr:
/// `extract [3 / 40] 123 Main St  completed  12 stored, 2 duplicates`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::RunStarted { total } => {
                format!("extract  {} properties queued\n", format_number(*total))
            }
            ProgressEvent::PropertyStarted { address } => format!("extract  {}  started\n", address),
            ProgressEvent::SourceSkipped {
                address,
                source,
                reason,
            } => format!("extract  {}  {} skipped: {}\n", address, source, reason),
            ProgressEvent::ImagesDiscovered {
                address,
                source,
                count,
            } => format!(
                "extract  {}  {} found {} images\n",
                address,
                source,
                format_number(*count)
            ),
            ProgressEvent::PropertyFinished {
                address,
                outcome,
                stored,
                duplicates,
                n,
                total,
            } => format!(
                "extract [{} / {}] {}  {}  {} stored, {} duplicates\n",
                format_number(*n),
                format_number(*total),
                address,
                outcome,
                format_number(*stored),
                format_number(*duplicates)
            ),
            ProgressEvent::LargeBatch { count, threshold } => format!(
                "warning: {} new images stored this run (threshold {})\n",
                format_number(*count),
                format_number(*threshold)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &ProgressEvent) -> serde_json::Value {
        match event {
            ProgressEvent::RunStarted { total } => serde_json::json!({
                "event": "run_started",
                "total": total
            }),
            ProgressEvent::PropertyStarted { address } => serde_json::json!({
                "event": "property_started",
                "address": address
            }),
            ProgressEvent::SourceSkipped {
                address,
                source,
                reason,
            } => serde_json::json!({
                "event": "source_skipped",
                "address": address,
                "source": source,
                "reason": reason
            }),
            ProgressEvent::ImagesDiscovered {
                address,
                source,
                count,
            } => serde_json::json!({
                "event": "images_discovered",
                "address": address,
                "source": source,
                "count": count
            }),
            ProgressEvent::PropertyFinished {
                address,
                outcome,
                stored,
                duplicates,
                n,
                total,
            } => serde_json::json!({
                "event": "property_finished",
                "address": address,
                "outcome": outcome,
                "stored": stored,
                "duplicates": duplicates,
                "n": n,
                "total": total
            }),
            ProgressEvent::LargeBatch { count, threshold } => serde_json::json!({
                "event": "large_batch",
                "count": count,
                "threshold": threshold
            }),
        }
    }
}

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode. The orchestrator shares it across workers.
    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn json_events_are_tagged() {
        let v = JsonProgress::to_json(&ProgressEvent::SourceSkipped {
            address: "123 Main St".into(),
            source: ImageSource::Redfin,
            reason: "circuit open".into(),
        });
        assert_eq!(v["event"], "source_skipped");
        assert_eq!(v["source"], "redfin");

        let v = JsonProgress::to_json(&ProgressEvent::LargeBatch {
            count: 150,
            threshold: 100,
        });
        assert_eq!(v["event"], "large_batch");
        assert_eq!(v["count"], 150);
    }
}
