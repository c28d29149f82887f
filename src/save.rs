//! save-output persistence
//!
//! When `save-output` is set, each test's artifacts land under a
//! deterministic `<dir>/<group>/<test>/` layout:
//!
//! - `command`        — the expanded command line that was run
//! - `output`         — captured output, raw bytes
//! - `status`         — `Successful`, `Failed`, `Timed out`,
//!   `Terminated by signal <NAME>`, or `Skipped`
//! - `output-matches` — the expected output, when that criterion was set
//!
//! Group and test names are sanitized to `[A-Za-z0-9_]` for use as
//! directory names.

use std::path::Path;

use crate::runner::{Outcome, RunReport, TestRecord};

/// Write every record of a report under `dir`.
pub fn save_report(dir: &Path, report: &RunReport) -> std::io::Result<()> {
    for record in &report.records {
        save_record(dir, record)?;
    }
    Ok(())
}

fn save_record(dir: &Path, record: &TestRecord) -> std::io::Result<()> {
    let path = dir.join(sanitize(&record.group)).join(sanitize(&record.name));
    std::fs::create_dir_all(&path)?;

    if let Some(ref command) = record.command_line {
        std::fs::write(path.join("command"), command)?;
    }
    if let Some(ref verdict) = record.verdict {
        std::fs::write(path.join("output"), &verdict.captured_output)?;
    }
    std::fs::write(path.join("status"), status_line(record))?;
    if let Some(ref expected) = record.expected_output {
        std::fs::write(path.join("output-matches"), expected)?;
    }
    Ok(())
}

fn status_line(record: &TestRecord) -> String {
    match record.outcome {
        Outcome::Passed => "Successful".to_string(),
        Outcome::Skipped => "Skipped".to_string(),
        Outcome::Failed => match record.verdict {
            Some(ref v) if v.timed_out => "Timed out".to_string(),
            Some(ref v) => match v.signal {
                Some(ref name) => format!("Terminated by signal {}", name),
                None => "Failed".to_string(),
            },
            None => "Failed".to_string(),
        },
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
