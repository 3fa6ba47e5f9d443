//! Flash jobs and their progress sequence
//!
//! A [`FlashJob`] couples a single-use image source with the producer side of
//! a progress channel. The consumer side is a [`ProgressStream`]: a lazy,
//! finite, non-restartable sequence of [`ProgressEvent`]s that ends when the
//! job is finished and its publisher dropped.
//!
//! Only the most recent event per destination is retained. A slow consumer
//! skips intermediate updates but always observes each destination's final
//! event.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use uuid::Uuid;

/// Chunk size used when adapting an `AsyncRead` into a source
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Inbound image bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Phase of a destination's flash
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashPhase {
    Flashing,
    Verifying,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::Flashing => f.write_str("flashing"),
            FlashPhase::Verifying => f.write_str("verifying"),
        }
    }
}

/// Progress of one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Destination identifier (the requested device path)
    pub destination: String,
    pub phase: FlashPhase,
    pub bytes_done: u64,
    /// Total bytes for this phase, when known up front
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
}

impl ProgressEvent {
    /// Percentage of the phase completed, when the total is known
    pub fn percent(&self) -> Option<f64> {
        self.bytes_total.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.bytes_done as f64 / total as f64) * 100.0
            }
        })
    }
}

/// Single-use image source
pub struct FlashSource {
    stream: ByteStream,
    size_hint: Option<u64>,
}

impl FlashSource {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            stream: Box::pin(stream),
            size_hint: None,
        }
    }

    /// Size of the source in bytes as transmitted (e.g. Content-Length)
    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    /// Source backed by an in-memory buffer
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let len = data.len() as u64;
        Self::new(stream::once(async move { Ok(data) })).with_size_hint(len)
    }

    /// Source backed by any async reader (file, socket, pipe)
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let chunks = stream::unfold(
            (reader, vec![0u8; READ_CHUNK_SIZE]),
            |(mut reader, mut buf)| async move {
                match reader.read(&mut buf).await {
                    Ok(0) => None,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        Some((Ok(chunk), (reader, buf)))
                    }
                    Err(e) => Some((Err(e), (reader, buf))),
                }
            },
        );
        Self::new(chunks)
    }

    pub fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    pub fn into_stream(self) -> ByteStream {
        self.stream
    }
}

impl fmt::Debug for FlashSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashSource")
            .field("size_hint", &self.size_hint)
            .finish_non_exhaustive()
    }
}

type Snapshot = BTreeMap<String, ProgressEvent>;

/// Producer side of a job's progress
#[derive(Debug)]
pub struct ProgressPublisher {
    tx: watch::Sender<Snapshot>,
}

impl ProgressPublisher {
    /// Replace the latest event for `event.destination`
    pub fn publish(&self, event: ProgressEvent) {
        self.tx.send_modify(|snapshot| {
            snapshot.insert(event.destination.clone(), event);
        });
    }

    /// Latest event per destination
    pub fn latest(&self) -> Vec<ProgressEvent> {
        self.tx.borrow().values().cloned().collect()
    }
}

/// Consumer side of a job's progress
pub struct ProgressStream {
    rx: watch::Receiver<Snapshot>,
    seen: HashMap<String, ProgressEvent>,
    pending: VecDeque<ProgressEvent>,
}

impl ProgressStream {
    /// Next unseen event, or `None` once the job has finished
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            if self.rx.changed().await.is_err() {
                return None;
            }

            let snapshot = self.rx.borrow_and_update().clone();
            for (destination, event) in snapshot {
                if self.seen.get(&destination) != Some(&event) {
                    self.seen.insert(destination, event.clone());
                    self.pending.push_back(event);
                }
            }
        }
    }

    /// Drain the remaining events
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        async_stream::stream! {
            let mut progress = self;
            while let Some(event) = progress.next().await {
                yield event;
            }
        }
    }
}

impl fmt::Debug for ProgressStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressStream")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// One flash request: image source plus progress producer
#[derive(Debug)]
pub struct FlashJob {
    id: Uuid,
    source: FlashSource,
    progress: ProgressPublisher,
}

impl FlashJob {
    /// Create a job and the progress sequence it will feed
    pub fn new(source: FlashSource) -> (Self, ProgressStream) {
        let (tx, rx) = watch::channel(Snapshot::new());
        let job = Self {
            id: Uuid::new_v4(),
            source,
            progress: ProgressPublisher { tx },
        };
        let stream = ProgressStream {
            rx,
            seen: HashMap::new(),
            pending: VecDeque::new(),
        };
        (job, stream)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn into_parts(self) -> (FlashSource, ProgressPublisher) {
        (self.source, self.progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn event(destination: &str, phase: FlashPhase, done: u64) -> ProgressEvent {
        ProgressEvent {
            destination: destination.to_string(),
            phase,
            bytes_done: done,
            bytes_total: Some(100),
        }
    }

    #[tokio::test]
    async fn test_stream_ends_when_job_is_dropped() {
        let (job, progress) = FlashJob::new(FlashSource::from_bytes(vec![0u8; 4]));
        let (_, publisher) = job.into_parts();

        publisher.publish(event("/dev/sda", FlashPhase::Flashing, 100));
        publisher.publish(event("/dev/sda", FlashPhase::Verifying, 100));
        drop(publisher);

        // Only the latest event per destination survives
        assert_eq!(
            progress.collect().await,
            vec![event("/dev/sda", FlashPhase::Verifying, 100)]
        );
    }

    #[tokio::test]
    async fn test_latest_event_kept_per_destination() {
        let (job, progress) = FlashJob::new(FlashSource::from_bytes(Vec::new()));
        let (_, publisher) = job.into_parts();

        publisher.publish(event("/dev/sda", FlashPhase::Flashing, 10));
        publisher.publish(event("/dev/sdb", FlashPhase::Flashing, 20));
        publisher.publish(event("/dev/sda", FlashPhase::Flashing, 30));
        drop(publisher);

        let events = progress.collect().await;
        assert_eq!(events.len(), 2);
        assert!(events.contains(&event("/dev/sda", FlashPhase::Flashing, 30)));
        assert!(events.contains(&event("/dev/sdb", FlashPhase::Flashing, 20)));
    }

    #[tokio::test]
    async fn test_consumer_sees_every_event_when_keeping_up() {
        let (job, progress) = FlashJob::new(FlashSource::from_bytes(Vec::new()));
        let (_, publisher) = job.into_parts();

        let consumer = tokio::spawn(progress.into_stream().collect::<Vec<_>>());

        for done in [25, 50, 100] {
            publisher.publish(event("/dev/sda", FlashPhase::Flashing, done));
            tokio::task::yield_now().await;
        }
        drop(publisher);

        let events = consumer.await.unwrap();
        let done: Vec<u64> = events.iter().map(|e| e.bytes_done).collect();
        assert_eq!(done, vec![25, 50, 100]);
    }

    #[tokio::test]
    async fn test_reader_source_yields_all_bytes() {
        let data: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let source = FlashSource::from_reader(std::io::Cursor::new(data.clone()));

        let chunks: Vec<Bytes> = source
            .into_stream()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, data);
        assert!(chunks.len() > 1);
    }

    #[test]
    fn test_percent() {
        let mut e = event("/dev/sda", FlashPhase::Verifying, 50);
        assert_eq!(e.percent(), Some(50.0));
        e.bytes_total = None;
        assert_eq!(e.percent(), None);
    }

    #[test]
    fn test_phase_serializes_lowercase() {
        let json = serde_json::to_string(&FlashPhase::Verifying).unwrap();
        assert_eq!(json, "\"verifying\"");
    }
}
