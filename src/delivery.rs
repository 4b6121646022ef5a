//! Puts rendered reports into rooms. Direct send first; transient failures
//! go onto a retry queue with exponential backoff and jitter, and a report
//! whose rich form keeps failing is dead-lettered with exactly one
//! plain-text fallback so the room still gets its digest.

use crate::adapter::{Artifact, ChatAdapter, SendOutcome};
use crate::error::DeliveryError;
use crate::model::{AnalysisResult, OutputFormat, Payload, RenderedReport};
use crate::report::render_text;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Bounds the retry backlog; a queued report keeps its rendered payload in
/// memory until it drains. Overflow skips the queue and goes straight to the
/// text fallback.
const QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    /// Retry attempts after the initial direct send.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Queued,
}

struct Pending {
    report: RenderedReport,
    result: Arc<AnalysisResult>,
    retries_done: u32,
}

pub struct DeliveryManager {
    adapter: Arc<dyn ChatAdapter>,
    tx: mpsc::Sender<Pending>,
    policy: DeliveryPolicy,
}

impl DeliveryManager {
    pub fn new(adapter: Arc<dyn ChatAdapter>, policy: DeliveryPolicy) -> Self {
        Self::with_capacity(adapter, policy, QUEUE_CAPACITY)
    }

    fn with_capacity(
        adapter: Arc<dyn ChatAdapter>,
        policy: DeliveryPolicy,
        capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Pending>(capacity);
        let worker_adapter = Arc::clone(&adapter);
        let worker_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(pending) = rx.recv().await {
                schedule_retry(
                    Arc::clone(&worker_adapter),
                    worker_tx.clone(),
                    policy,
                    pending,
                );
            }
        });
        Self {
            adapter,
            tx,
            policy,
        }
    }

    /// Sends one report. `Queued` means a transient failure was absorbed and
    /// the retry queue owns it now; the caller is done either way.
    pub async fn deliver(
        &self,
        report: RenderedReport,
        result: Arc<AnalysisResult>,
    ) -> Result<DeliveryStatus, DeliveryError> {
        match attempt_send(self.adapter.as_ref(), &report).await {
            SendOutcome::Delivered => {
                info!(room = report.room_id, format = %report.format, "report delivered");
                Ok(DeliveryStatus::Sent)
            }
            SendOutcome::Transient(reason) => {
                let room_id = report.room_id.clone();
                let pending = Pending {
                    report,
                    result,
                    retries_done: 0,
                };
                match self.try_enqueue(pending) {
                    Ok(()) => {
                        warn!(room = room_id, reason, "delivery queued for retry");
                        Ok(DeliveryStatus::Queued)
                    }
                    Err(pending) => {
                        dead_letter(
                            self.adapter.as_ref(),
                            &pending.report,
                            &pending.result,
                            "retry queue full",
                        )
                        .await;
                        Err(DeliveryError::Fatal("retry queue full".to_string()))
                    }
                }
            }
            SendOutcome::Fatal(reason) => {
                dead_letter(self.adapter.as_ref(), &report, &result, &reason).await;
                Err(DeliveryError::Fatal(reason))
            }
        }
    }

    fn try_enqueue(&self, pending: Pending) -> Result<(), Pending> {
        self.tx.try_send(pending).map_err(|e| match e {
            mpsc::error::TrySendError::Full(p) | mpsc::error::TrySendError::Closed(p) => p,
        })
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }
}

fn schedule_retry(
    adapter: Arc<dyn ChatAdapter>,
    tx: mpsc::Sender<Pending>,
    policy: DeliveryPolicy,
    pending: Pending,
) {
    tokio::spawn(async move {
        tokio::time::sleep(retry_delay(policy.base_delay, pending.retries_done)).await;
        match attempt_send(adapter.as_ref(), &pending.report).await {
            SendOutcome::Delivered => {
                info!(
                    room = pending.report.room_id,
                    retries = pending.retries_done + 1,
                    "report delivered after retry"
                );
            }
            SendOutcome::Transient(reason) => {
                let retries_done = pending.retries_done + 1;
                if retries_done < policy.max_attempts {
                    warn!(
                        room = pending.report.room_id,
                        retries_done, reason, "delivery retry failed, requeueing"
                    );
                    let requeued = Pending {
                        retries_done,
                        ..pending
                    };
                    if let Err(
                        mpsc::error::TrySendError::Full(p)
                        | mpsc::error::TrySendError::Closed(p),
                    ) = tx.try_send(requeued)
                    {
                        dead_letter(adapter.as_ref(), &p.report, &p.result, "retry queue full")
                            .await;
                    }
                } else {
                    dead_letter(adapter.as_ref(), &pending.report, &pending.result, &reason).await;
                }
            }
            SendOutcome::Fatal(reason) => {
                dead_letter(adapter.as_ref(), &pending.report, &pending.result, &reason).await;
            }
        }
    });
}

/// Exponential backoff with a small random jitter so synchronized failures
/// do not retry in lockstep.
fn retry_delay(base: Duration, retries_done: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(1..=5);
    base * 2u32.saturating_pow(retries_done) + Duration::from_secs(jitter)
}

async fn attempt_send(adapter: &dyn ChatAdapter, report: &RenderedReport) -> SendOutcome {
    match &report.payload {
        Payload::Text(text) => {
            adapter
                .send(&report.room_id, &Artifact::Text(text.clone()))
                .await
        }
        Payload::Bytes(bytes) => {
            let (mime, filename) = match report.format {
                OutputFormat::Image => ("image/png", "digest.png"),
                OutputFormat::Pdf => ("application/pdf", "digest.pdf"),
                OutputFormat::Text => ("text/plain", "digest.txt"),
            };
            let media = match adapter.upload(bytes, mime, filename).await {
                Ok(media) => media,
                Err(e) => return SendOutcome::Transient(format!("upload failed: {e}")),
            };
            adapter
                .send(
                    &report.room_id,
                    &Artifact::Media {
                        media,
                        caption: "Daily digest".to_string(),
                        filename: filename.to_string(),
                    },
                )
                .await
        }
    }
}

/// Terminal failure of the rich report. Logged, then exactly one plain-text
/// rendition is attempted so the content is not lost.
async fn dead_letter(
    adapter: &dyn ChatAdapter,
    report: &RenderedReport,
    result: &AnalysisResult,
    reason: &str,
) {
    error!(
        room = report.room_id,
        format = %report.format,
        reason,
        "report delivery dead-lettered"
    );
    if matches!(report.payload, Payload::Text(_)) {
        // The failing payload already was text; nothing simpler to fall
        // back to.
        return;
    }
    match adapter
        .send(&report.room_id, &Artifact::Text(render_text(result)))
        .await
    {
        SendOutcome::Delivered => {
            info!(room = report.room_id, "text fallback delivered");
        }
        SendOutcome::Transient(e) | SendOutcome::Fatal(e) => {
            error!(room = report.room_id, error = e, "text fallback failed too");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MediaRef;
    use crate::model::Message;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails media sends `fail_sends` times, then succeeds. Counts text
    /// sends separately to observe the fallback.
    struct FlakyAdapter {
        fail_sends: usize,
        fatal: bool,
        media_sends: AtomicUsize,
        text_sends: AtomicUsize,
    }

    impl FlakyAdapter {
        fn new(fail_sends: usize, fatal: bool) -> Self {
            Self {
                fail_sends,
                fatal,
                media_sends: AtomicUsize::new(0),
                text_sends: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatAdapter for FlakyAdapter {
        async fn fetch_history(
            &self,
            _room_id: &str,
            _since: DateTime<Utc>,
            _limit: usize,
        ) -> anyhow::Result<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn send(&self, _room_id: &str, artifact: &Artifact) -> SendOutcome {
            match artifact {
                Artifact::Text(_) => {
                    self.text_sends.fetch_add(1, Ordering::SeqCst);
                    SendOutcome::Delivered
                }
                Artifact::Media { .. } => {
                    let n = self.media_sends.fetch_add(1, Ordering::SeqCst);
                    if self.fatal {
                        SendOutcome::Fatal("no permission to post media".to_string())
                    } else if n < self.fail_sends {
                        SendOutcome::Transient("server busy".to_string())
                    } else {
                        SendOutcome::Delivered
                    }
                }
                Artifact::Poll(_) => SendOutcome::Delivered,
            }
        }

        async fn upload(
            &self,
            _bytes: &[u8],
            _mime: &str,
            _filename: &str,
        ) -> anyhow::Result<MediaRef> {
            Ok(MediaRef {
                uri: "mxc://example.org/abc".to_string(),
                mime: "image/png".to_string(),
            })
        }
    }

    fn image_report() -> RenderedReport {
        RenderedReport {
            room_id: "!room:x".to_string(),
            format: OutputFormat::Image,
            payload: Payload::Bytes(vec![1, 2, 3]),
            template_id: "scrapbook".to_string(),
        }
    }

    fn result() -> Arc<AnalysisResult> {
        Arc::new(AnalysisResult::empty("!room:x", Utc::now()))
    }

    fn policy() -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }

    async fn wait_for(counter: &AtomicUsize, target: usize) {
        tokio::time::timeout(Duration::from_secs(3600), async {
            while counter.load(Ordering::SeqCst) < target {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn clean_send_is_immediate() {
        let adapter = Arc::new(FlakyAdapter::new(0, false));
        let manager = DeliveryManager::new(adapter.clone(), policy());
        let status = manager.deliver(image_report(), result()).await.unwrap();
        assert_eq!(status, DeliveryStatus::Sent);
        assert_eq!(adapter.media_sends.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.text_sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_then_succeeds() {
        let adapter = Arc::new(FlakyAdapter::new(2, false));
        let manager = DeliveryManager::new(adapter.clone(), policy());
        let status = manager.deliver(image_report(), result()).await.unwrap();
        assert_eq!(status, DeliveryStatus::Queued);

        wait_for(&adapter.media_sends, 3).await;
        // Retries succeeded; no fallback was needed.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(adapter.text_sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fall_back_to_text_exactly_once() {
        let adapter = Arc::new(FlakyAdapter::new(usize::MAX, false));
        let manager = DeliveryManager::new(adapter.clone(), policy());
        let status = manager.deliver(image_report(), result()).await.unwrap();
        assert_eq!(status, DeliveryStatus::Queued);

        wait_for(&adapter.text_sends, 1).await;
        // Direct try + three retries, then the queue went quiet.
        assert_eq!(adapter.media_sends.load(Ordering::SeqCst), 4);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(adapter.text_sends.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.media_sends.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn full_queue_degrades_to_text_fallback() {
        let adapter = Arc::new(FlakyAdapter::new(usize::MAX, false));
        let manager = DeliveryManager::with_capacity(adapter.clone(), policy(), 1);

        // Neither deliver yields to the worker task on this runtime, so the
        // single slot is still taken when the second report arrives.
        let first = manager.deliver(image_report(), result()).await.unwrap();
        assert_eq!(first, DeliveryStatus::Queued);
        let err = manager.deliver(image_report(), result()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Fatal(_)));
        assert_eq!(adapter.text_sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_failure_skips_retries_and_falls_back() {
        let adapter = Arc::new(FlakyAdapter::new(0, true));
        let manager = DeliveryManager::new(adapter.clone(), policy());
        let err = manager.deliver(image_report(), result()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Fatal(_)));
        assert_eq!(adapter.media_sends.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.text_sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_delay_grows_exponentially() {
        let base = Duration::from_secs(5);
        for retries in 0..3u32 {
            let delay = retry_delay(base, retries);
            let floor = base * 2u32.pow(retries) + Duration::from_secs(1);
            let ceil = base * 2u32.pow(retries) + Duration::from_secs(5);
            assert!(delay >= floor && delay <= ceil, "delay {delay:?} out of band");
        }
    }
}
