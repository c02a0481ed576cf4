//! Build progress reporting.
//!
//! Reports what `pkgsearch build` is doing so users see which phase is
//! running and how many packages are left to embed. Progress goes to
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// Phase of the build pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildPhase {
    Ingesting,
    Embedding,
    Indexing,
    Validating,
    Publishing,
}

impl BuildPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::Ingesting => "ingesting",
            BuildPhase::Embedding => "embedding",
            BuildPhase::Indexing => "indexing",
            BuildPhase::Validating => "validating",
            BuildPhase::Publishing => "publishing",
        }
    }
}

/// A single progress event for a build.
#[derive(Clone, Debug)]
pub enum BuildProgressEvent {
    /// A phase started for the given generation.
    Phase { generation: u64, phase: BuildPhase },
    /// Embedding progress: `n` packages settled out of `total` needing work.
    Embedded { n: u64, total: u64 },
}

/// Reports build progress. Implementations write to stderr (human or JSON).
pub trait BuildProgressReporter: Send + Sync {
    fn report(&self, event: BuildProgressEvent);
}

/// Human-friendly progress on stderr: "build gen 3  embedding  1,234 / 5,000 packages".
pub struct StderrProgress;

impl BuildProgressReporter for StderrProgress {
    fn report(&self, event: BuildProgressEvent) {
        let line = match &event {
            BuildProgressEvent::Phase { generation, phase } => {
                format!("build gen {}  {}...\n", generation, phase.as_str())
            }
            BuildProgressEvent::Embedded { n, total } => format!(
                "build  embedding  {} / {} packages\n",
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BuildProgressReporter for JsonProgress {
    fn report(&self, event: BuildProgressEvent) {
        let obj = match &event {
            BuildProgressEvent::Phase { generation, phase } => serde_json::json!({
                "event": "progress",
                "generation": generation,
                "phase": phase.as_str(),
            }),
            BuildProgressEvent::Embedded { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "embedding",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl BuildProgressReporter for NoProgress {
    fn report(&self, _event: BuildProgressEvent) {}
}

/// `1234567` → `"1,234,567"`.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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

    pub fn reporter(&self) -> Box<dyn BuildProgressReporter> {
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
    fn phase_names() {
        assert_eq!(BuildPhase::Validating.as_str(), "validating");
        assert_eq!(BuildPhase::Publishing.as_str(), "publishing");
    }
}
