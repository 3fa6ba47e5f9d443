//! Critical section guard for hardware-affecting operations
//!
//! At most one guarded operation runs at a time per owner. Waiters suspend on
//! an async mutex (FIFO, so operations run in the order they asked), and the
//! permit is an RAII guard: it is released on success, on error and when the
//! guarded future is dropped mid-flight.

use std::future::Future;

use tokio::sync::Mutex;
use tracing::trace;

/// Serializes guarded operations for one worker
pub struct CriticalSection {
    name: &'static str,
    lock: Mutex<()>,
}

impl CriticalSection {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: Mutex::new(()),
        }
    }

    /// Run `operation` once no other guarded operation is executing
    pub async fn run<F>(&self, operation: F) -> F::Output
    where
        F: Future,
    {
        let _permit = self.lock.lock().await;
        trace!(section = self.name, "Entered critical section");
        let output = operation.await;
        trace!(section = self.name, "Leaving critical section");
        output
    }

    /// Whether a guarded operation is currently executing
    pub fn is_held(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for CriticalSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CriticalSection")
            .field("name", &self.name)
            .field("held", &self.is_held())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Log(std::sync::Mutex<Vec<&'static str>>);

    impl Log {
        fn push(&self, entry: &'static str) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_do_not_overlap() {
        let section = Arc::new(CriticalSection::new("test"));
        let log = Arc::new(Log::default());

        let first = {
            let section = section.clone();
            let log = log.clone();
            tokio::spawn(async move {
                section
                    .run(async {
                        log.push("first:start");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        log.push("first:end");
                    })
                    .await
            })
        };

        // Let the first task take the section
        while !section.is_held() {
            tokio::task::yield_now().await;
        }

        let second = {
            let section = section.clone();
            let log = log.clone();
            tokio::spawn(async move {
                section
                    .run(async {
                        log.push("second:start");
                        log.push("second:end");
                    })
                    .await
            })
        };

        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(
            log.entries(),
            vec!["first:start", "first:end", "second:start", "second:end"]
        );
    }

    #[tokio::test]
    async fn test_released_after_error() {
        let section = CriticalSection::new("test");

        let result: Result<(), &str> = section.run(async { Err("boom") }).await;

        assert!(result.is_err());
        assert!(!section.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_after_cancellation() {
        let section = CriticalSection::new("test");

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            section.run(tokio::time::sleep(Duration::from_secs(60))),
        )
        .await;

        assert!(cancelled.is_err());
        assert!(!section.is_held());
        section.run(async {}).await;
    }
}
