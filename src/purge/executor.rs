use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::confidence::ConfidenceEngine;
use super::{PurgeRecord, ScanSummary};
use crate::archive::ArchiveStore;
use crate::browser::{BrowserError, PageHandle};
use crate::config::Config;
use crate::error::SentinelError;
use crate::session::SessionHandle;
use crate::telemetry::ActivityInstrumentor;

/// Pages scoring strictly below this are purged
pub const PURGE_THRESHOLD: f64 = 0.05;

pub fn should_purge(confidence: f64) -> bool {
    confidence < PURGE_THRESHOLD
}

enum Verdict {
    Kept,
    WouldPurge,
    Purged(PurgeRecord),
}

/// Runs scan cycles: score every page, close the cold ones, archive them.
pub struct PurgeExecutor {
    config: Arc<Config>,
    instrumentor: ActivityInstrumentor,
    archive: Arc<ArchiveStore>,
}

impl PurgeExecutor {
    pub fn new(config: Arc<Config>, archive: Arc<ArchiveStore>) -> Self {
        Self {
            instrumentor: ActivityInstrumentor::new(config.page_timeout()),
            config,
            archive,
        }
    }

    /// One full pass over the session's pages.
    ///
    /// A failing page is logged and skipped; only failing to enumerate the
    /// pages at all is an error.
    pub async fn scan(
        &self,
        session: &SessionHandle,
        dry_run: bool,
    ) -> Result<ScanSummary, SentinelError> {
        let pages = session.pages().await?;

        for page in &pages {
            self.instrumentor.install(page.as_ref()).await;
        }
        if !pages.is_empty() && !self.config.settle_delay().is_zero() {
            tokio::time::sleep(self.config.settle_delay()).await;
        }

        let mut summary = ScanSummary {
            dry_run,
            ..ScanSummary::default()
        };
        let mut batch = Vec::new();

        for page in &pages {
            match self.evaluate_page(page.as_ref(), dry_run).await {
                Ok(Verdict::Kept) => summary.kept += 1,
                Ok(Verdict::WouldPurge) => summary.purged += 1,
                Ok(Verdict::Purged(record)) => {
                    summary.purged += 1;
                    batch.push(record);
                }
                Err(e) => {
                    summary.skipped += 1;
                    tracing::warn!(target_id = %page.id(), url = %page.url(), error = %e, "skipping page");
                }
            }
        }

        if !batch.is_empty() {
            if let Err(e) = self.archive.save_batch(&batch).await {
                tracing::error!(count = batch.len(), error = %e, "failed to archive purged tabs");
            }
        }

        tracing::info!(
            session = session.id(),
            purged = summary.purged,
            kept = summary.kept,
            skipped = summary.skipped,
            dry_run,
            "scan complete"
        );
        Ok(summary)
    }

    async fn evaluate_page(
        &self,
        page: &dyn PageHandle,
        dry_run: bool,
    ) -> Result<Verdict, BrowserError> {
        let now_ms = Utc::now().timestamp_millis();
        let vector = self.instrumentor.read(page, now_ms).await?;
        let idle_seconds = vector.idle_seconds(now_ms);
        let result = ConfidenceEngine::score(&vector, idle_seconds, &self.config);

        tracing::debug!(
            title = %truncate(page.title(), 20),
            fingerprint = %result.fingerprint,
            confidence = %format!("{:.1}%", result.confidence * 100.0),
            idle_seconds,
            "scored page"
        );

        if !should_purge(result.confidence) {
            return Ok(Verdict::Kept);
        }
        if dry_run {
            tracing::info!(title = %page.title(), fingerprint = %result.fingerprint, "[dry run] would purge");
            return Ok(Verdict::WouldPurge);
        }

        let timeout = self.config.page_timeout();
        tokio::time::timeout(timeout, page.close())
            .await
            .map_err(|_| BrowserError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
                context: format!("closing {}", page.url()),
            })??;

        tracing::info!(title = %page.title(), fingerprint = %result.fingerprint, "purged");
        Ok(Verdict::Purged(PurgeRecord {
            title: page.title().to_string(),
            url: page.url().to_string(),
            timestamp: Utc::now(),
            fingerprint: result.fingerprint,
        }))
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Scan, wait `interval`, repeat until `cancel` fires.
///
/// Cancellation is only observed between cycles; a scan in progress always
/// runs to completion. Returns the number of completed cycles.
pub async fn run_loop(
    executor: &PurgeExecutor,
    session: &SessionHandle,
    interval: Duration,
    dry_run: bool,
    cancel: CancellationToken,
) -> u64 {
    let mut cycles = 0;
    loop {
        if let Err(e) = executor.scan(session, dry_run).await {
            tracing::error!(error = %e, "scan failed");
        }
        cycles += 1;

        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
    }
    tracing::info!(cycles, "monitoring stopped");
    cycles
}
