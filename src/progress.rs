//! Harvest progress reporting.
//!
//! Reports observable progress during `harvest run` and `harvest dispatch`
//! so operators see which set is seeding, how many documents a task has
//! left and when a version is indexed. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts, and is independent of the
//! `tracing` log stream.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum HarvestProgressEvent {
    /// A set is being seeded from its source. Total unknown.
    Seeding { set: String, pages: u64 },
    /// Seeding of a set finished.
    Seeded { set: String, documents: u64 },
    /// A document task processed `n` of `total` documents.
    Processing {
        set: String,
        task: String,
        n: u64,
        total: u64,
    },
    /// Documents pushed to an index.
    Indexing { index: String, n: u64, total: u64 },
    /// A dataset version reached a new state.
    Version { version: String, state: String },
}

/// Reports harvest progress. Implementations write to stderr (human or JSON).
pub trait HarvestProgressReporter: Send + Sync {
    fn report(&self, event: HarvestProgressEvent);
}

/// Human-friendly progress: "harvest edurep:all  check_url  1,234 / 5,000 documents".
pub struct StderrProgress;

fn human_line(event: &HarvestProgressEvent) -> String {
    match event {
        HarvestProgressEvent::Seeding { set, pages } => {
            format!("harvest {}  seeding  {} pages\n", set, format_number(*pages))
        }
        HarvestProgressEvent::Seeded { set, documents } => {
            format!(
                "harvest {}  seeded  {} documents\n",
                set,
                format_number(*documents)
            )
        }
        HarvestProgressEvent::Processing { set, task, n, total } => format!(
            "harvest {}  {}  {} / {} documents\n",
            set,
            task,
            format_number(*n),
            format_number(*total)
        ),
        HarvestProgressEvent::Indexing { index, n, total } => format!(
            "index {}  pushed  {} / {} documents\n",
            index,
            format_number(*n),
            format_number(*total)
        ),
        HarvestProgressEvent::Version { version, state } => {
            format!("version {}  {}\n", version, state)
        }
    }
}

impl HarvestProgressReporter for StderrProgress {
    fn report(&self, event: HarvestProgressEvent) {
        let line = human_line(&event);
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

fn json_event(event: &HarvestProgressEvent) -> serde_json::Value {
    match event {
        HarvestProgressEvent::Seeding { set, pages } => serde_json::json!({
            "event": "progress",
            "set": set,
            "phase": "seeding",
            "pages": pages
        }),
        HarvestProgressEvent::Seeded { set, documents } => serde_json::json!({
            "event": "progress",
            "set": set,
            "phase": "seeded",
            "documents": documents
        }),
        HarvestProgressEvent::Processing { set, task, n, total } => serde_json::json!({
            "event": "progress",
            "set": set,
            "phase": "processing",
            "task": task,
            "n": n,
            "total": total
        }),
        HarvestProgressEvent::Indexing { index, n, total } => serde_json::json!({
            "event": "progress",
            "index": index,
            "phase": "indexing",
            "n": n,
            "total": total
        }),
        HarvestProgressEvent::Version { version, state } => serde_json::json!({
            "event": "version",
            "version": version,
            "state": state
        }),
    }
}

impl HarvestProgressReporter for JsonProgress {
    fn report(&self, event: HarvestProgressEvent) {
        if let Ok(line) = serde_json::to_string(&json_event(&event)) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl HarvestProgressReporter for NoProgress {
    fn report(&self, _event: HarvestProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
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

    /// Parse `--progress auto|human|json|off`.
    pub fn from_flag(flag: &str) -> anyhow::Result<Self> {
        match flag {
            "auto" => Ok(Self::default_for_tty()),
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            "off" => Ok(Self::Off),
            other => anyhow::bail!(
                "Unknown progress mode: '{}'. Available: auto, human, json, off",
                other
            ),
        }
    }

    pub fn reporter(&self) -> Box<dyn HarvestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
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
    fn human_and_json_lines() {
        let event = HarvestProgressEvent::Processing {
            set: "edurep:all".into(),
            task: "check_url".into(),
            n: 1234,
            total: 5000,
        };
        assert_eq!(
            human_line(&event),
            "harvest edurep:all  check_url  1,234 / 5,000 documents\n"
        );
        let json = json_event(&event);
        assert_eq!(json["phase"], "processing");
        assert_eq!(json["task"], "check_url");
        assert_eq!(json["total"], 5000);
    }

    #[test]
    fn progress_flags() {
        assert_eq!(ProgressMode::from_flag("json").unwrap(), ProgressMode::Json);
        assert_eq!(ProgressMode::from_flag("off").unwrap(), ProgressMode::Off);
        assert!(ProgressMode::from_flag("loud").is_err());
    }
}
