//! Termination hook armed while the DUT is powered
//!
//! If the process is interrupted with the DUT powered, the hook runs the
//! worker's teardown so the board is not left supplying the DUT.
//!
//! Tokio cannot give a signal back to the default disposition once it has
//! installed a handler, so the listener is started on the first `register`
//! and lives as long as the process. Disarming only clears the action: a
//! signal arriving while disarmed still exits the process straight away.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Action run when termination is requested
pub type TerminationAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Called with the exit code once a signal has been handled
pub type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

/// Installs and removes a termination action
pub trait TerminationHook: Send + Sync {
    /// Arm the hook, replacing any previously registered action
    fn register(&self, action: TerminationAction);

    /// Disarm the hook. No-op when nothing is registered.
    fn deregister(&self);

    fn is_registered(&self) -> bool;
}

/// Termination signals the hook reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    Interrupt,
    Terminate,
}

impl TermSignal {
    /// Conventional shell exit code, 128 + signal number
    pub fn exit_code(self) -> i32 {
        match self {
            TermSignal::Interrupt => 128 + 2,
            TermSignal::Terminate => 128 + 15,
        }
    }
}

type SignalSource = Box<dyn FnOnce() -> BoxStream<'static, TermSignal> + Send>;

/// Hook listening for SIGINT and SIGTERM
pub struct SignalHook {
    armed: Arc<Mutex<Option<TerminationAction>>>,
    /// Taken when the listener starts
    source: Mutex<Option<SignalSource>>,
    exit: ExitFn,
}

impl Default for SignalHook {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHook {
    /// Hook on the process's SIGINT/SIGTERM, exiting the process after handling
    pub fn new() -> Self {
        Self::with_source(os_signals, Arc::new(|code: i32| {
            std::process::exit(code);
        }))
    }

    /// Hook on an arbitrary signal source with a custom exit function
    pub fn with_source<F>(source: F, exit: ExitFn) -> Self
    where
        F: FnOnce() -> BoxStream<'static, TermSignal> + Send + 'static,
    {
        Self {
            armed: Arc::new(Mutex::new(None)),
            source: Mutex::new(Some(Box::new(source))),
            exit,
        }
    }

    /// Whether the process-wide listener is running
    pub fn is_listening(&self) -> bool {
        self.source.lock().is_none()
    }

    fn ensure_listening(&self) {
        let Some(source) = self.source.lock().take() else {
            return;
        };

        let armed = self.armed.clone();
        let exit = self.exit.clone();
        tokio::spawn(dispatch(source(), armed, exit));
        info!("Termination signal listener started");
    }
}

impl TerminationHook for SignalHook {
    fn register(&self, action: TerminationAction) {
        self.ensure_listening();
        if self.armed.lock().replace(action).is_some() {
            debug!("Termination hook re-armed");
        } else {
            debug!("Termination hook armed");
        }
    }

    fn deregister(&self) {
        if self.armed.lock().take().is_some() {
            debug!("Termination hook disarmed");
        }
    }

    fn is_registered(&self) -> bool {
        self.armed.lock().is_some()
    }
}

/// Handle each signal: run the armed action, if any, then exit
async fn dispatch(
    mut signals: BoxStream<'static, TermSignal>,
    armed: Arc<Mutex<Option<TerminationAction>>>,
    exit: ExitFn,
) {
    while let Some(signal) = signals.next().await {
        // Disarm before running: teardown deregisters the hook itself
        let action = armed.lock().take();
        match action {
            Some(action) => {
                warn!(?signal, "Termination signal received while DUT powered, tearing down");
                action().await;
            }
            None => info!(?signal, "Termination signal received, exiting"),
        }
        exit(signal.exit_code());
    }
    debug!("Termination signal source closed");
}

#[cfg(unix)]
fn os_signals() -> BoxStream<'static, TermSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(interrupt), Ok(terminate)) => {
            stream::unfold((interrupt, terminate), |(mut interrupt, mut terminate)| async move {
                let signal = tokio::select! {
                    Some(()) = interrupt.recv() => TermSignal::Interrupt,
                    Some(()) = terminate.recv() => TermSignal::Terminate,
                    else => return None,
                };
                Some((signal, (interrupt, terminate)))
            })
            .boxed()
        }
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Cannot install SIGTERM handler, only SIGINT is handled");
            ctrl_c_signals()
        }
    }
}

#[cfg(not(unix))]
fn os_signals() -> BoxStream<'static, TermSignal> {
    ctrl_c_signals()
}

fn ctrl_c_signals() -> BoxStream<'static, TermSignal> {
    stream::unfold((), |()| async {
        tokio::signal::ctrl_c()
            .await
            .ok()
            .map(|()| (TermSignal::Interrupt, ()))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use futures::FutureExt;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    /// Hook fed from a channel, logging actions and exits in order
    fn scripted_hook() -> (
        SignalHook,
        mpsc::UnboundedSender<TermSignal>,
        UnboundedSender<String>,
        UnboundedReceiver<String>,
    ) {
        let (signal_tx, signal_rx) = mpsc::unbounded();
        let (log_tx, log_rx) = unbounded_channel();
        let exit_log = log_tx.clone();
        let hook = SignalHook::with_source(
            move || signal_rx.boxed(),
            Arc::new(move |code: i32| {
                let _ = exit_log.send(format!("exit {}", code));
            }),
        );
        (hook, signal_tx, log_tx, log_rx)
    }

    fn logging_action(log: &UnboundedSender<String>) -> TerminationAction {
        let log = log.clone();
        Arc::new(move || {
            let log = log.clone();
            async move {
                let _ = log.send("teardown".to_string());
            }
            .boxed()
        })
    }

    async fn next_entry(log: &mut UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), log.recv())
            .await
            .expect("timed out waiting for the hook")
            .expect("log closed")
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let (hook, _signals, log, _entries) = scripted_hook();
        assert!(!hook.is_registered());
        assert!(!hook.is_listening());

        hook.register(logging_action(&log));
        assert!(hook.is_registered());
        assert!(hook.is_listening());

        hook.deregister();
        assert!(!hook.is_registered());

        // Deregistering twice is harmless
        hook.deregister();
        assert!(!hook.is_registered());
    }

    #[tokio::test]
    async fn test_signal_while_armed_runs_action_then_exits() {
        let (hook, signals, log, mut entries) = scripted_hook();
        hook.register(logging_action(&log));

        signals.unbounded_send(TermSignal::Interrupt).unwrap();

        assert_eq!(next_entry(&mut entries).await, "teardown");
        assert_eq!(next_entry(&mut entries).await, "exit 130");
        assert!(!hook.is_registered());
    }

    #[tokio::test]
    async fn test_signal_after_deregister_still_exits() {
        let (hook, signals, log, mut entries) = scripted_hook();
        hook.register(logging_action(&log));
        hook.deregister();

        signals.unbounded_send(TermSignal::Terminate).unwrap();

        // Listener stays installed: the process exits without running teardown
        assert_eq!(next_entry(&mut entries).await, "exit 143");
        assert!(entries.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_replaces_previous_action() {
        let (hook, signals, log, mut entries) = scripted_hook();
        let (other_tx, mut other_rx) = unbounded_channel();
        hook.register(logging_action(&other_tx));
        hook.register(logging_action(&log));

        signals.unbounded_send(TermSignal::Terminate).unwrap();

        assert_eq!(next_entry(&mut entries).await, "teardown");
        assert_eq!(next_entry(&mut entries).await, "exit 143");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_listener_started_once_across_power_cycles() {
        let (hook, signals, log, mut entries) = scripted_hook();
        for _ in 0..3 {
            hook.register(logging_action(&log));
            hook.deregister();
        }
        hook.register(logging_action(&log));

        signals.unbounded_send(TermSignal::Interrupt).unwrap();

        assert_eq!(next_entry(&mut entries).await, "teardown");
        assert_eq!(next_entry(&mut entries).await, "exit 130");
        // A second listener would have produced a second exit
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(entries.try_recv().is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TermSignal::Interrupt.exit_code(), 130);
        assert_eq!(TermSignal::Terminate.exit_code(), 143);
    }
}
