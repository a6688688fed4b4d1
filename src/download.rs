use std::fs;

use camino::Utf8Path;

use crate::client::{CutoutClient, Transfer};
use crate::error::CutoutError;
use crate::pipeline::{ProgressEvent, ProgressSink};
use crate::retry::{CancelToken, RetryPolicy};

pub struct Downloader<C: CutoutClient> {
    client: C,
    policy: RetryPolicy,
}

impl<C: CutoutClient> Downloader<C> {
    pub fn new(client: C, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Submits `document` until the archive lands at `archive` and returns
    /// its size. The archive path only ever holds a complete body.
    /// `recorded_attempts` is bumped once per submission, whatever the outcome.
    pub fn fetch(
        &self,
        unit: usize,
        document: &str,
        archive: &Utf8Path,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
        recorded_attempts: &mut u32,
    ) -> Result<u64, CutoutError> {
        let partial = archive.with_extension("part");
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(CutoutError::Cancelled);
            }
            attempts += 1;
            *recorded_attempts += 1;
            sink.event(ProgressEvent::unit(
                unit,
                format!("phase=Download; attempt {attempts}"),
            ));

            let mut throttle = ProgressThrottle::new(unit, sink);
            let result = self.client.submit(
                unit,
                document,
                partial.as_std_path(),
                &mut |transfer| throttle.update(transfer),
            );

            match result {
                Ok(info) => {
                    fs::rename(partial.as_std_path(), archive.as_std_path())
                        .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
                    tracing::info!(unit, attempts, bytes = info.bytes, "archive downloaded");
                    return Ok(info.bytes);
                }
                Err(err) if err.is_transient() => {
                    discard_partial(&partial);
                    if self.policy.is_exhausted(attempts) {
                        tracing::error!(unit, attempts, error = %err, "giving up on unit");
                        return Err(CutoutError::RetriesExhausted { unit, attempts });
                    }
                    let delay = self.policy.backoff.delay(attempts);
                    if self.policy.is_stuck(attempts) {
                        tracing::warn!(
                            unit,
                            attempts,
                            error = %err,
                            "unit appears stuck; still retrying"
                        );
                    } else {
                        tracing::warn!(
                            unit,
                            attempts,
                            error = %err,
                            delay_secs = delay.as_secs_f64(),
                            "download failed; retrying"
                        );
                    }
                    if cancel.sleep(delay) {
                        return Err(CutoutError::Cancelled);
                    }
                }
                Err(err) => {
                    discard_partial(&partial);
                    return Err(err);
                }
            }
        }
    }
}

fn discard_partial(partial: &Utf8Path) {
    if partial.as_std_path().exists() {
        if let Err(err) = fs::remove_file(partial.as_std_path()) {
            tracing::warn!(path = %partial, error = %err, "failed to remove partial archive");
        }
    }
}

/// Forwards byte counts at whole-percent steps.
struct ProgressThrottle<'a> {
    unit: usize,
    sink: &'a dyn ProgressSink,
    last_percent: Option<u64>,
}

impl<'a> ProgressThrottle<'a> {
    fn new(unit: usize, sink: &'a dyn ProgressSink) -> Self {
        Self {
            unit,
            sink,
            last_percent: None,
        }
    }

    fn update(&mut self, transfer: Transfer) {
        let percent = if transfer.expected == 0 {
            0
        } else {
            (transfer.bytes.saturating_mul(100) / transfer.expected).min(100)
        };
        if self.last_percent == Some(percent) {
            return;
        }
        self.last_percent = Some(percent);
        self.sink.event(ProgressEvent {
            unit: Some(self.unit),
            message: format!("phase=Download; {percent}%"),
            transfer: Some(transfer),
        });
    }
}
