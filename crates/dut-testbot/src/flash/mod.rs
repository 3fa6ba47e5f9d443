//! Image flashing onto the DUT storage
//!
//! ```text
//!  inbound stream ──▶ ImageReader (raw | gzip) ──▶ SHA-256
//!                                    │
//!               ┌────────────────────┼────────────────────┐
//!               ▼                    ▼                    ▼
//!          destination 1        destination 2   ...  destination N
//!           (flashing)           (flashing)
//!               │                    │
//!               ▼                    ▼
//!          read back + hash     read back + hash      (verifying)
//! ```
//!
//! Destinations are written concurrently. A destination that fails is logged
//! and dropped from later phases while the others carry on; the flash only
//! fails when no destination survives.

mod source;

use std::path::{Path, PathBuf};

use bytes::Bytes;
use dut_core::{
    retry, FlashJob, FlashPhase, ProgressEvent, ProgressPublisher, RetryPolicy, WorkerError,
    WorkerResult,
};
use futures::future::join_all;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use source::ImageReader;

/// Chunk size used when reading destinations back
const VERIFY_CHUNK_SIZE: usize = 64 * 1024;

/// Write buffer per destination
const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// A resolved destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashTarget {
    /// Identifier reported in progress events (the requested path)
    pub id: String,
    /// Canonical device path
    pub path: PathBuf,
}

/// Outcome of a flash job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashReport {
    pub job_id: Uuid,
    pub bytes_written: u64,
    /// Hex SHA-256 of the (decompressed) image
    pub sha256: String,
    pub compressed: bool,
    /// Destinations written and verified
    pub healthy: Vec<String>,
    /// Destinations dropped, with the reason
    pub failed: Vec<(String, String)>,
}

struct Destination {
    target: FlashTarget,
    writer: Option<BufWriter<File>>,
    failure: Option<String>,
}

impl Destination {
    fn is_healthy(&self) -> bool {
        self.failure.is_none()
    }

    fn fail(&mut self, reason: String) {
        warn!(destination = %self.target.id, reason = %reason, "Destination failed, excluding it");
        self.writer = None;
        self.failure = Some(reason);
    }
}

/// Drives one flash job from inbound stream to verified destinations
#[derive(Debug, Clone)]
pub struct FlashOrchestrator {
    resolve_policy: RetryPolicy,
    /// Runs on each surviving target between writing and verifying
    #[cfg(test)]
    before_verify: Option<fn(&FlashTarget)>,
}

impl Default for FlashOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashOrchestrator {
    pub fn new() -> Self {
        Self {
            resolve_policy: RetryPolicy::device_resolution(),
            #[cfg(test)]
            before_verify: None,
        }
    }

    /// Override the policy used while waiting for the device node
    pub fn with_resolve_policy(mut self, policy: RetryPolicy) -> Self {
        self.resolve_policy = policy;
        self
    }

    /// Resolve a device path, waiting for it to appear after a mux switch
    pub async fn resolve(&self, requested: &Path) -> WorkerResult<FlashTarget> {
        let path = retry(&self.resolve_policy, |attempt| async move {
            debug!(path = %requested.display(), attempt, "Resolving destination");
            tokio::fs::canonicalize(requested).await.map_err(|e| {
                WorkerError::Flash(format!("cannot resolve {}: {}", requested.display(), e))
            })
        })
        .await?;

        info!(requested = %requested.display(), resolved = %path.display(), "Destination resolved");
        Ok(FlashTarget {
            id: requested.display().to_string(),
            path,
        })
    }

    /// Write the job's image to every target, then verify each by reading it back
    pub async fn run(&self, targets: &[FlashTarget], job: FlashJob) -> WorkerResult<FlashReport> {
        if targets.is_empty() {
            return Err(WorkerError::InvalidRequest(
                "flash requires at least one destination".to_string(),
            ));
        }

        let job_id = job.id();
        let (source, progress) = job.into_parts();
        let size_hint = source.size_hint();
        let mut reader = ImageReader::new(source.into_stream());

        // Nothing touches a destination before the image is known to be non-empty
        let first = reader
            .next_chunk()
            .await
            .map_err(|e| WorkerError::Flash(format!("failed to read image: {}", e)))?
            .ok_or_else(|| WorkerError::Flash("image is empty".to_string()))?;

        let compressed = reader.is_compressed().unwrap_or(false);
        let bytes_total = if compressed { None } else { size_hint };
        info!(%job_id, destinations = targets.len(), compressed, ?bytes_total, "Starting flash");

        let mut destinations = open_destinations(targets).await;
        ensure_survivors(&destinations)?;

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut chunk = Some(first);

        while let Some(data) = chunk {
            hasher.update(&data);
            write_chunk(&mut destinations, &data).await;
            ensure_survivors(&destinations)?;

            written += data.len() as u64;
            publish(&progress, &destinations, FlashPhase::Flashing, written, bytes_total);
            tokio::task::yield_now().await;

            chunk = reader
                .next_chunk()
                .await
                .map_err(|e| WorkerError::Flash(format!("failed to read image: {}", e)))?;
        }

        finish_writes(&mut destinations).await;
        ensure_survivors(&destinations)?;

        let digest = hasher.finalize();
        let sha256 = hex::encode(&digest);
        debug!(%job_id, bytes = written, sha256 = %sha256, "Image written, verifying");

        #[cfg(test)]
        if let Some(hook) = self.before_verify {
            destinations
                .iter()
                .filter(|d| d.is_healthy())
                .for_each(|d| hook(&d.target));
        }

        let results = join_all(
            destinations
                .iter()
                .filter(|d| d.is_healthy())
                .map(|d| verify(&d.target, written, digest.as_slice(), &progress)),
        )
        .await;
        let mut results = results.into_iter();
        for dest in destinations.iter_mut().filter(|d| d.is_healthy()) {
            if let Some(Err(reason)) = results.next() {
                dest.fail(reason);
            }
        }
        ensure_survivors(&destinations)?;

        let report = FlashReport {
            job_id,
            bytes_written: written,
            sha256,
            compressed,
            healthy: destinations
                .iter()
                .filter(|d| d.is_healthy())
                .map(|d| d.target.id.clone())
                .collect(),
            failed: destinations
                .iter()
                .filter_map(|d| d.failure.clone().map(|f| (d.target.id.clone(), f)))
                .collect(),
        };
        info!(
            %job_id,
            bytes = report.bytes_written,
            healthy = report.healthy.len(),
            failed = report.failed.len(),
            "Flash complete"
        );
        Ok(report)
    }
}

async fn open_destinations(targets: &[FlashTarget]) -> Vec<Destination> {
    let opened = join_all(targets.iter().map(|target| async move {
        OpenOptions::new().write(true).open(&target.path).await
    }))
    .await;

    targets
        .iter()
        .zip(opened)
        .map(|(target, file)| {
            let mut dest = Destination {
                target: target.clone(),
                writer: None,
                failure: None,
            };
            match file {
                Ok(file) => dest.writer = Some(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)),
                Err(e) => dest.fail(format!("open failed: {}", e)),
            }
            dest
        })
        .collect()
}

async fn write_chunk(destinations: &mut [Destination], data: &Bytes) {
    let results = join_all(
        destinations
            .iter_mut()
            .filter(|d| d.writer.is_some())
            .map(|dest| async move {
                let result = match dest.writer.as_mut() {
                    Some(writer) => writer.write_all(data).await,
                    None => Ok(()),
                };
                (dest, result)
            }),
    )
    .await;

    for (dest, result) in results {
        if let Err(e) = result {
            dest.fail(format!("write failed: {}", e));
        }
    }
}

async fn finish_writes(destinations: &mut [Destination]) {
    let results = join_all(destinations.iter_mut().map(|dest| async move {
        let result = match dest.writer.take() {
            Some(mut writer) => match writer.flush().await {
                Ok(()) => writer.get_ref().sync_all().await,
                Err(e) => Err(e),
            },
            None => Ok(()),
        };
        (dest, result)
    }))
    .await;

    for (dest, result) in results {
        if let Err(e) = result {
            dest.fail(format!("sync failed: {}", e));
        }
    }
}

/// Read back `len` bytes from the target and compare against `expected`
async fn verify(
    target: &FlashTarget,
    len: u64,
    expected: &[u8],
    progress: &ProgressPublisher,
) -> Result<(), String> {
    let mut file = File::open(&target.path)
        .await
        .map_err(|e| format!("reopen for verify failed: {}", e))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; VERIFY_CHUNK_SIZE];
    let mut done: u64 = 0;

    while done < len {
        let want = ((len - done) as usize).min(buf.len());
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(|e| format!("read back failed: {}", e))?;
        if n == 0 {
            return Err(format!("device ended after {} of {} bytes", done, len));
        }
        hasher.update(&buf[..n]);
        done += n as u64;

        progress.publish(ProgressEvent {
            destination: target.id.clone(),
            phase: FlashPhase::Verifying,
            bytes_done: done,
            bytes_total: Some(len),
        });
        tokio::task::yield_now().await;
    }

    if hasher.finalize().as_slice() != expected {
        return Err("verification mismatch".to_string());
    }
    debug!(destination = %target.id, "Verified");
    Ok(())
}

fn publish(
    progress: &ProgressPublisher,
    destinations: &[Destination],
    phase: FlashPhase,
    bytes_done: u64,
    bytes_total: Option<u64>,
) {
    for dest in destinations.iter().filter(|d| d.is_healthy()) {
        progress.publish(ProgressEvent {
            destination: dest.target.id.clone(),
            phase,
            bytes_done,
            bytes_total,
        });
    }
}

fn ensure_survivors(destinations: &[Destination]) -> WorkerResult<()> {
    if destinations.iter().any(Destination::is_healthy) {
        return Ok(());
    }

    let reasons: Vec<String> = destinations
        .iter()
        .filter_map(|d| d.failure.as_ref().map(|f| format!("{}: {}", d.target.id, f)))
        .collect();
    Err(WorkerError::Flash(format!(
        "all destinations failed ({})",
        reasons.join("; ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dut_core::FlashSource;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn target(file: &NamedTempFile) -> FlashTarget {
        FlashTarget {
            id: file.path().display().to_string(),
            path: file.path().to_path_buf(),
        }
    }

    fn quick() -> FlashOrchestrator {
        FlashOrchestrator::new().with_resolve_policy(RetryPolicy::new(2, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_raw_image_written_and_verified() {
        let disk = NamedTempFile::new().unwrap();
        let image: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let (job, progress) = FlashJob::new(FlashSource::from_bytes(image.clone()));

        let report = quick().run(&[target(&disk)], job).await.unwrap();

        assert_eq!(std::fs::read(disk.path()).unwrap(), image);
        assert_eq!(report.bytes_written, image.len() as u64);
        assert_eq!(report.sha256, hex::encode(Sha256::digest(&image)));
        assert!(!report.compressed);
        assert!(report.failed.is_empty());

        let events = progress.collect().await;
        let last = events.last().unwrap();
        assert_eq!(last.phase, FlashPhase::Verifying);
        assert_eq!(last.bytes_done, image.len() as u64);
    }

    #[tokio::test]
    async fn test_gzip_image_is_decompressed_onto_disk() {
        let disk = NamedTempFile::new().unwrap();
        let image = b"bootable".repeat(1000);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&image).unwrap();
        let (job, _progress) = FlashJob::new(FlashSource::from_bytes(encoder.finish().unwrap()));

        let report = quick().run(&[target(&disk)], job).await.unwrap();

        assert!(report.compressed);
        assert_eq!(std::fs::read(disk.path()).unwrap(), image);
    }

    #[tokio::test]
    async fn test_empty_image_rejected_before_writing() {
        let mut disk = NamedTempFile::new().unwrap();
        disk.write_all(b"previous contents").unwrap();
        let (job, _progress) = FlashJob::new(FlashSource::from_bytes(Vec::new()));

        let err = quick().run(&[target(&disk)], job).await.unwrap_err();

        assert!(matches!(err, WorkerError::Flash(ref m) if m.contains("empty")));
        assert_eq!(std::fs::read(disk.path()).unwrap(), b"previous contents");
    }

    #[tokio::test]
    async fn test_failing_destination_is_excluded() {
        let good = NamedTempFile::new().unwrap();
        let missing = FlashTarget {
            id: "/dev/missing".to_string(),
            path: PathBuf::from("/nonexistent/dir/disk"),
        };
        let (job, progress) = FlashJob::new(FlashSource::from_bytes(vec![7u8; 1024]));

        let report = quick()
            .run(&[missing, target(&good)], job)
            .await
            .unwrap();

        assert_eq!(report.healthy, vec![target(&good).id]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "/dev/missing");

        let events = progress.collect().await;
        assert!(events.iter().all(|e| e.destination != "/dev/missing"));
    }

    fn full_device() -> Option<FlashTarget> {
        let path = PathBuf::from("/dev/full");
        path.exists().then(|| FlashTarget {
            id: "/dev/full".to_string(),
            path,
        })
    }

    #[tokio::test]
    async fn test_write_failure_after_open_is_excluded() {
        let Some(full) = full_device() else {
            return;
        };
        let good = NamedTempFile::new().unwrap();
        // Larger than the write buffer so the error surfaces from the write itself
        let image = vec![7u8; 2 * WRITE_BUFFER_SIZE];
        let (job, progress) = FlashJob::new(FlashSource::from_bytes(image.clone()));

        let report = quick().run(&[full, target(&good)], job).await.unwrap();

        assert_eq!(report.healthy, vec![target(&good).id]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "/dev/full");
        assert!(report.failed[0].1.starts_with("write failed"), "{}", report.failed[0].1);
        assert_eq!(std::fs::read(good.path()).unwrap(), image);

        let events = progress.collect().await;
        assert!(events.iter().all(|e| e.destination != "/dev/full"));
    }

    #[tokio::test]
    async fn test_sync_failure_is_excluded() {
        let Some(full) = full_device() else {
            return;
        };
        let good = NamedTempFile::new().unwrap();
        // Fits in the write buffer: the device only rejects it on flush
        let (job, _progress) = FlashJob::new(FlashSource::from_bytes(vec![3u8; 4096]));

        let report = quick().run(&[target(&good), full], job).await.unwrap();

        assert_eq!(report.healthy, vec![target(&good).id]);
        assert_eq!(report.failed[0].0, "/dev/full");
        assert!(report.failed[0].1.starts_with("sync failed"), "{}", report.failed[0].1);
    }

    /// Overwrites the first byte of targets whose id is tagged `corrupt:`
    fn corrupt_tagged(target: &FlashTarget) {
        if target.id.starts_with("corrupt:") {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .open(&target.path)
                .unwrap();
            file.write_all(b"X").unwrap();
        }
    }

    #[tokio::test]
    async fn test_verification_mismatch_is_excluded() {
        let good = NamedTempFile::new().unwrap();
        let bad = NamedTempFile::new().unwrap();
        let corrupted = FlashTarget {
            id: format!("corrupt:{}", bad.path().display()),
            path: bad.path().to_path_buf(),
        };
        let mut orchestrator = quick();
        orchestrator.before_verify = Some(corrupt_tagged);
        let (job, _progress) = FlashJob::new(FlashSource::from_bytes(vec![7u8; 8192]));

        let report = orchestrator
            .run(&[corrupted.clone(), target(&good)], job)
            .await
            .unwrap();

        assert_eq!(report.healthy, vec![target(&good).id]);
        assert_eq!(
            report.failed,
            vec![(corrupted.id, "verification mismatch".to_string())]
        );
    }

    #[tokio::test]
    async fn test_all_destinations_failing_is_an_error() {
        let missing = FlashTarget {
            id: "/dev/missing".to_string(),
            path: PathBuf::from("/nonexistent/dir/disk"),
        };
        let (job, _progress) = FlashJob::new(FlashSource::from_bytes(vec![1u8; 16]));

        let err = quick().run(&[missing], job).await.unwrap_err();

        assert!(matches!(err, WorkerError::Flash(ref m) if m.contains("all destinations failed")));
    }

    #[tokio::test]
    async fn test_resolve_gives_up_with_cause() {
        let err = quick()
            .resolve(Path::new("/nonexistent/disk/by-id/sd"))
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Flash(ref m) if m.contains("cannot resolve")));
    }

    #[tokio::test]
    async fn test_resolve_keeps_requested_id() {
        let disk = NamedTempFile::new().unwrap();

        let resolved = quick().resolve(disk.path()).await.unwrap();

        assert_eq!(resolved.id, disk.path().display().to_string());
        assert_eq!(resolved.path, std::fs::canonicalize(disk.path()).unwrap());
    }
}
