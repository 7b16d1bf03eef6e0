//! Segment worker (§4.D): one cooperative task per byte range.
//!
//! Each worker resumes from its segment's persisted `downloaded` offset,
//! pulls bytes through the rate limiter in ≤64 KiB slices, writes them at
//! their absolute file offset, and checkpoints progress in coalesced
//! batches rather than on every chunk.

use crate::error::DlmanError;
use crate::events::EventBus;
use crate::persistence::Storage;
use crate::rate_limiter::RateLimiterChain;
use crate::transport;
use crate::writer::SharedWriterHandle;
use bytes::Bytes;
use dlman_types::{CoreEvent, Segment, SegmentEnd};
use futures_util::StreamExt;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const READ_CHUNK_BYTES: u64 = 64 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250); // ≤ 4/sec
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);

/// How a segment worker's loop ended.
pub enum SegmentOutcome {
    Completed(Segment),
    Retryable(Segment, DlmanError),
    Fatal(Segment, DlmanError),
    Cancelled(Segment),
}

pub struct SegmentWorker {
    pub download_id: Uuid,
    pub client: Client,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub writer: SharedWriterHandle,
    pub rate_limiter: RateLimiterChain,
    pub events: EventBus,
    pub storage: Storage,
    pub cancel: CancellationToken,
}

impl SegmentWorker {
    /// Run one segment to completion, to a retryable/fatal error, or to
    /// cancellation. Always returns the segment's latest known state so the
    /// caller can persist and plan a resume without re-deriving it.
    pub async fn run(self, mut segment: Segment) -> SegmentOutcome {
        if segment.complete {
            return SegmentOutcome::Completed(segment);
        }

        let fetch_start = segment.start + segment.downloaded;
        let fetch_end = segment.end.known();

        if let (Some(end), true) = (fetch_end, fetch_start > end) {
            // Resumed past the end already recorded — nothing left to do.
            segment.complete = true;
            return SegmentOutcome::Completed(segment);
        }

        let response =
            match transport::fetch_range(&self.client, &self.url, &self.headers, fetch_start, fetch_end)
                .await
            {
                Ok(response) => response,
                Err(err) if err.is_retryable() => return SegmentOutcome::Retryable(segment, err),
                Err(err) => return SegmentOutcome::Fatal(segment, err),
            };

        let mut stream = response.bytes_stream();
        let mut pending = Bytes::new();
        let mut last_progress = Instant::now();
        let mut last_checkpoint = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                self.checkpoint(&segment).await;
                return SegmentOutcome::Cancelled(segment);
            }

            if pending.is_empty() {
                match stream.next().await {
                    Some(Ok(bytes)) => pending = bytes,
                    Some(Err(e)) => {
                        let err = DlmanError::from_reqwest(e);
                        self.checkpoint(&segment).await;
                        return if err.is_retryable() {
                            SegmentOutcome::Retryable(segment, err)
                        } else {
                            SegmentOutcome::Fatal(segment, err)
                        };
                    }
                    None => break, // stream ended: EOF
                }
            }

            let take = (READ_CHUNK_BYTES as usize).min(pending.len());
            let chunk = pending.split_to(take);

            if self.cancel.is_cancelled() {
                self.checkpoint(&segment).await;
                return SegmentOutcome::Cancelled(segment);
            }

            self.rate_limiter.acquire(chunk.len() as u64).await;

            let offset = segment.start + segment.downloaded;
            if let Err(err) = self.writer.write_at(offset, &chunk).await {
                self.checkpoint(&segment).await;
                return SegmentOutcome::Fatal(segment, err);
            }
            segment.downloaded += chunk.len() as u64;

            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                self.emit_progress(&segment);
                last_progress = Instant::now();
            }
            if last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL {
                self.checkpoint(&segment).await;
                last_checkpoint = Instant::now();
            }
        }

        if let Some(end) = fetch_end {
            let expected = end - segment.start + 1;
            if segment.downloaded != expected {
                let err = DlmanError::ContentChanged(format!(
                    "segment {} expected {expected} bytes, got {}",
                    segment.index, segment.downloaded
                ));
                self.checkpoint(&segment).await;
                return SegmentOutcome::Fatal(segment, err);
            }
        } else {
            // Open-ended segment: the stream's natural close tells us the
            // true size for the first time.
            segment.end = SegmentEnd::Known(segment.start + segment.downloaded - 1);
        }

        segment.complete = true;
        self.checkpoint(&segment).await;
        SegmentOutcome::Completed(segment)
    }

    fn emit_progress(&self, segment: &Segment) {
        self.events.publish(CoreEvent::Progress {
            id: self.download_id,
            downloaded: segment.downloaded,
            total: segment.size(),
            speed: 0, // aggregated across segments by the download task
            eta: None,
        });
    }

    async fn checkpoint(&self, segment: &Segment) {
        if let Err(err) = self
            .storage
            .checkpoint_segment(self.download_id, segment)
            .await
        {
            tracing::warn!(download_id = %self.download_id, segment = segment.index, error = %err, "failed to checkpoint segment progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::SharedWriter;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn storage() -> Storage {
        Storage::open(tempfile::NamedTempFile::new().unwrap().path().to_path_buf())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn completes_a_known_size_segment() {
        let server = MockServer::start().await;
        let body = vec![7u8; 1000];
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-999/1000")
                    .set_body_bytes(body.clone()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("f.bin");
        let writer = Arc::new(SharedWriter::open(&final_path, Some(1000)).await.unwrap());

        let worker = SegmentWorker {
            download_id: Uuid::new_v4(),
            client: Client::new(),
            url: format!("{}/f", server.uri()),
            headers: vec![],
            writer: writer.clone(),
            rate_limiter: RateLimiterChain::new(
                crate::rate_limiter::TokenBucket::unlimited(),
                crate::rate_limiter::TokenBucket::unlimited(),
                crate::rate_limiter::TokenBucket::unlimited(),
            ),
            events: EventBus::new(),
            storage: storage().await,
            cancel: CancellationToken::new(),
        };

        let segment = Segment::new(0, 0, SegmentEnd::Known(999));
        match worker.run(segment).await {
            SegmentOutcome::Completed(segment) => {
                assert!(segment.complete);
                assert_eq!(segment.downloaded, 1000);
            }
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_mid_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-999/1000")
                    .set_body_bytes(vec![1u8; 1000]),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("f.bin");
        let writer = Arc::new(SharedWriter::open(&final_path, Some(1000)).await.unwrap());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let worker = SegmentWorker {
            download_id: Uuid::new_v4(),
            client: Client::new(),
            url: format!("{}/f", server.uri()),
            headers: vec![],
            writer,
            rate_limiter: RateLimiterChain::new(
                crate::rate_limiter::TokenBucket::unlimited(),
                crate::rate_limiter::TokenBucket::unlimited(),
                crate::rate_limiter::TokenBucket::unlimited(),
            ),
            events: EventBus::new(),
            storage: storage().await,
            cancel,
        };

        let segment = Segment::new(0, 0, SegmentEnd::Known(999));
        match worker.run(segment).await {
            SegmentOutcome::Cancelled(segment) => assert!(!segment.complete),
            _ => panic!("expected cancellation"),
        }
    }
}
