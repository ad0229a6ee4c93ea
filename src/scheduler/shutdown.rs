//! Two-stage shutdown: the first interrupt drains, the second forces.
//!
//! [`ShutdownCoordinator`] is the only writer. Everything else holds a
//! read-only [`ShutdownHandle`] and checks it at safe points.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Current shutdown stage. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownLevel {
    Running,
    /// Finish in-flight work, start nothing new.
    Drain,
    /// Abandon in-flight work now.
    Force,
}

impl ShutdownLevel {
    fn next(self) -> Self {
        match self {
            ShutdownLevel::Running => ShutdownLevel::Drain,
            ShutdownLevel::Drain | ShutdownLevel::Force => ShutdownLevel::Force,
        }
    }
}

/// Exit status used when a third interrupt kills the process.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptResponse {
    Drain,
    Force,
    Exit,
}

/// Owns the shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<ShutdownLevel>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Creates a coordinator at `Running`.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ShutdownLevel::Running);
        Self { tx: Arc::new(tx) }
    }

    /// A read-only view for workers and the orchestrator.
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            rx: self.tx.subscribe(),
        }
    }

    pub fn level(&self) -> ShutdownLevel {
        *self.tx.borrow()
    }

    /// Moves one stage forward and returns the new level.
    pub fn escalate(&self) -> ShutdownLevel {
        let mut reached = ShutdownLevel::Running;
        self.tx.send_modify(|level| {
            *level = level.next();
            reached = *level;
        });
        reached
    }

    /// Applies one interrupt. Once `Force` has been reached, a further
    /// interrupt asks for the process to exit.
    fn interrupt(&self) -> InterruptResponse {
        if self.level() == ShutdownLevel::Force {
            return InterruptResponse::Exit;
        }
        match self.escalate() {
            ShutdownLevel::Force => InterruptResponse::Force,
            _ => InterruptResponse::Drain,
        }
    }

    /// Spawns the Ctrl+C / SIGTERM listener. The first signal drains, the
    /// second forces, and a third exits the process with status 130.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            let mut terminate = {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(error = %e, "failed to install SIGTERM handler");
                        None
                    }
                }
            };

            loop {
                #[cfg(unix)]
                let term = async {
                    match terminate.as_mut() {
                        Some(s) => {
                            s.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                #[cfg(not(unix))]
                let term = std::future::pending::<()>();

                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            warn!(error = %e, "failed to install CTRL+C signal handler");
                            return;
                        }
                    }
                    _ = term => {}
                }

                match coordinator.interrupt() {
                    InterruptResponse::Drain => warn!(
                        "Interrupt received: finishing in-flight tasks. Press Ctrl+C again to force quit"
                    ),
                    InterruptResponse::Force => {
                        error!("Second interrupt: forcing shutdown. Press Ctrl+C again to exit now")
                    }
                    InterruptResponse::Exit => {
                        error!("Third interrupt: exiting immediately");
                        std::process::exit(EXIT_INTERRUPTED);
                    }
                }
            }
        })
    }
}

/// Read-only view of the shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    rx: watch::Receiver<ShutdownLevel>,
}

impl ShutdownHandle {
    pub fn level(&self) -> ShutdownLevel {
        *self.rx.borrow()
    }

    /// True for both `Drain` and `Force`.
    pub fn is_draining(&self) -> bool {
        self.level() >= ShutdownLevel::Drain
    }

    pub fn is_forced(&self) -> bool {
        self.level() == ShutdownLevel::Force
    }

    /// Resolves once `Force` is reached. Never resolves if the coordinator
    /// is dropped first.
    pub async fn forced(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|level| *level == ShutdownLevel::Force).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

type ExitHook = Box<dyn FnOnce() + Send>;

/// Runs registered cleanup hooks when dropped, in reverse registration order.
///
/// Drop runs on normal return, on `?` propagation and during panic unwind,
/// so hooks fire however the run ended.
#[derive(Default)]
pub struct ExitGuard {
    hooks: Mutex<Vec<(&'static str, ExitHook)>>,
}

impl ExitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_exit(&self, name: &'static str, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push((name, Box::new(hook)));
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let hooks = match self.hooks.get_mut() {
            Ok(hooks) => std::mem::take(hooks),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for (name, hook) in hooks.into_iter().rev() {
            info!(hook = name, "Running exit hook");
            hook();
        }
    }
}
