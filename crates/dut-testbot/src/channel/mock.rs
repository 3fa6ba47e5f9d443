//! Mock command link for testing
//!
//! Records every frame written with the (tokio) time it was written, so tests
//! can check frame order and settle delays without a board attached.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{BoardVersion, CommandLink, LinkError, LinkOpener};

/// One frame as it reached the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedFrame {
    pub bytes: [u8; 3],
    pub at: Instant,
}

/// Shared record of everything written to mock links
#[derive(Debug, Default)]
pub struct FrameLog {
    frames: Mutex<Vec<RecordedFrame>>,
    opens: Mutex<u32>,
    closes: Mutex<u32>,
}

impl FrameLog {
    pub fn entries(&self) -> Vec<RecordedFrame> {
        self.frames.lock().clone()
    }

    /// Frame bytes only, in write order
    pub fn frames(&self) -> Vec<[u8; 3]> {
        self.frames.lock().iter().map(|f| f.bytes).collect()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    pub fn opens(&self) -> u32 {
        *self.opens.lock()
    }

    pub fn closes(&self) -> u32 {
        *self.closes.lock()
    }
}

/// How the mock board answers the ready wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockReady {
    Ready(BoardVersion),
    /// The link fails while reading
    Fail,
    /// The board never answers
    Never,
}

/// Opener handing out [`MockLink`]s that share one [`FrameLog`]
#[derive(Debug, Clone)]
pub struct MockLinkOpener {
    log: Arc<FrameLog>,
    ready: MockReady,
    fail_open: bool,
}

impl MockLinkOpener {
    pub fn new() -> Self {
        Self {
            log: Arc::new(FrameLog::default()),
            ready: MockReady::Ready(BoardVersion { major: 2, minor: 5 }),
            fail_open: false,
        }
    }

    pub fn with_ready(mut self, ready: MockReady) -> Self {
        self.ready = ready;
        self
    }

    /// Make every open attempt fail
    pub fn failing(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn log(&self) -> Arc<FrameLog> {
        self.log.clone()
    }
}

impl Default for MockLinkOpener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkOpener for MockLinkOpener {
    async fn open(&self, path: &str, _baud_rate: u32) -> Result<Box<dyn CommandLink>, LinkError> {
        if self.fail_open {
            return Err(LinkError::Open {
                path: path.to_string(),
                reason: "no such device".to_string(),
            });
        }
        *self.log.opens.lock() += 1;
        Ok(Box::new(MockLink {
            log: self.log.clone(),
            ready: self.ready,
        }))
    }
}

/// Recording link
#[derive(Debug)]
pub struct MockLink {
    log: Arc<FrameLog>,
    ready: MockReady,
}

#[async_trait]
impl CommandLink for MockLink {
    async fn wait_ready(&mut self) -> Result<BoardVersion, LinkError> {
        match self.ready {
            MockReady::Ready(version) => Ok(version),
            MockReady::Fail => Err(LinkError::Read("unexpected end of stream".to_string())),
            MockReady::Never => std::future::pending().await,
        }
    }

    async fn write_frame(&mut self, frame: [u8; 3]) -> Result<(), LinkError> {
        self.log.frames.lock().push(RecordedFrame {
            bytes: frame,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        *self.log.closes.lock() += 1;
        Ok(())
    }
}
