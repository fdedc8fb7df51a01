//! Bulk dispatch over one session's transport.
//!
//! Items are split into fixed-size batches. A batch's sends run
//! concurrently; batches are separated by a pacing delay so a large blast
//! doesn't look like a flood to the remote service. One item failing never
//! aborts the rest; failures are collected and echoed back with the
//! original item so callers can retry selectively.

use crate::config::BulkConfig;
use crate::supervisor::ConnectionSupervisor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One outgoing message in a bulk request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItem {
    pub recipient: String,
    pub payload: String,
}

/// Per-call overrides for the configured pacing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkOptions {
    pub batch_size: Option<usize>,
    pub inter_batch_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SentItem {
    pub recipient: String,
    pub message_id: String,
}

/// A failed item carries the original request for selective retry.
#[derive(Debug, Clone, Serialize)]
pub struct FailedItem {
    pub item: BulkItem,
    pub error: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BulkReport {
    pub sent: Vec<SentItem>,
    pub failed: Vec<FailedItem>,
}

impl BulkReport {
    pub fn total(&self) -> usize {
        self.sent.len() + self.failed.len()
    }
}

pub struct BulkDispatcher {
    supervisor: Arc<ConnectionSupervisor>,
    config: BulkConfig,
}

impl BulkDispatcher {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, config: BulkConfig) -> Self {
        Self { supervisor, config }
    }

    /// Dispatch every item, `batch_size` at a time. The report preserves
    /// item order within `sent` and `failed`.
    pub async fn send_bulk(
        &self,
        session_id: Uuid,
        items: Vec<BulkItem>,
        opts: Option<BulkOptions>,
    ) -> BulkReport {
        let opts = opts.unwrap_or_default();
        let batch_size = opts.batch_size.unwrap_or(self.config.batch_size).max(1);
        let delay =
            Duration::from_millis(opts.inter_batch_delay_ms.unwrap_or(self.config.inter_batch_delay_ms));

        let total = items.len();
        let mut report = BulkReport::default();
        let mut batches = items.chunks(batch_size).peekable();

        while let Some(batch) = batches.next() {
            let sends = batch.iter().map(|item| {
                let supervisor = Arc::clone(&self.supervisor);
                async move {
                    supervisor
                        .send(session_id, &item.recipient, &item.payload)
                        .await
                }
            });
            let outcomes = futures_util::future::join_all(sends).await;

            for (item, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(message_id) => report.sent.push(SentItem {
                        recipient: item.recipient.clone(),
                        message_id,
                    }),
                    Err(err) => {
                        tracing::warn!(
                            session = %session_id,
                            recipient = %item.recipient,
                            "bulk item failed: {err}"
                        );
                        report.failed.push(FailedItem {
                            item: item.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }

            if batches.peek().is_some() {
                tokio::time::sleep(delay).await;
            }
        }

        tracing::info!(
            session = %session_id,
            total,
            sent = report.sent.len(),
            failed = report.failed.len(),
            "bulk dispatch finished"
        );
        report
    }
}
