use std::io::{self, Write};

use serde::Serialize;

use crate::pipeline::{ProgressEvent, ProgressSink, RunReport};
use crate::state::UnitRecord;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

/// Machine-readable output on stdout. As a sink it stays silent so stdout
/// carries exactly one JSON document.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_status(records: &[UnitRecord]) -> io::Result<()> {
        Self::print_json(&records)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Routes progress events into the tracing subscriber.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        if let Some(transfer) = event.transfer {
            if transfer.expected == 0 {
                return;
            }
            let percent = transfer.bytes.saturating_mul(100) / transfer.expected;
            if percent % 10 == 0 {
                tracing::info!(
                    unit = event.unit,
                    bytes = transfer.bytes,
                    expected = transfer.expected,
                    "{percent}% received"
                );
            }
            return;
        }

        let message = event.message.trim();
        match parse_phase(message) {
            Some((phase, payload)) => {
                tracing::info!(unit = event.unit, phase, "{payload}");
            }
            None => tracing::info!(unit = event.unit, "{message}"),
        }
    }
}

fn parse_phase(message: &str) -> Option<(&str, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (phase, payload) = rest.split_once(';').unwrap_or((rest, ""));
    Some((phase.trim(), payload.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_prefix_is_split_out() {
        assert_eq!(
            parse_phase("phase=Download; attempt 2"),
            Some(("Download", "attempt 2"))
        );
        assert_eq!(parse_phase("phase=Done"), Some(("Done", "")));
        assert_eq!(parse_phase("archive downloaded"), None);
    }
}
