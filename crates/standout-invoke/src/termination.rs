//! Cooperative cancellation on process termination.
//!
//! The pipeline turns OS interrupt and terminate notifications into
//! cancellation of the invocation's [`CancellationToken`], while keeping the
//! process's real exit status:
//!
//! ```text
//! Idle ──first cancellation_token()──▶ Armed
//! Armed ──interrupt──▶ token cancelled, default termination suppressed, still Armed
//! Armed ──terminate──▶ token cancelled, wait for the gate, exit(final result code)
//! Armed ──release / drop──▶ Torn down (listeners stopped, gate open)
//! ```
//!
//! Nothing is installed until a handler actually asks for the token, so
//! commands that never look at cancellation keep the platform's default
//! signal behavior.
//!
//! The gate is a `watch` channel that opens exactly once, when the pipeline
//! has applied the deferred result and knows the final result code. A
//! terminate notification that arrives while the handler is still running
//! waits for it and then exits with that code.
//!
//! Tokio never unregisters an OS signal handler once installed. To keep the
//! platform behavior once every coordinator has been released, the OS source
//! carries a process-wide [`DefaultDisposition`]: a notification that arrives
//! while nothing is armed exits with [`INTERRUPT_EXIT_CODE`] or
//! [`TERMINATE_EXIT_CODE`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, StreamExt};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::InvocationContext;
use crate::pipeline::{Middleware, Next, PipelineBuilder};
use crate::priority::Priority;

/// Exit code used when the grace period after an interrupt runs out.
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// Exit code for a terminate notification that arrives while nothing is armed.
pub const TERMINATE_EXIT_CODE: i32 = 143;

/// A source of termination notifications.
pub trait SignalSource: Send + Sync {
    /// Interrupt notifications (Ctrl+C), one item per notification.
    fn interrupts(&self) -> BoxStream<'static, ()>;

    /// Terminate notifications (SIGTERM, process shutdown).
    fn terminations(&self) -> BoxStream<'static, ()>;

    /// Fallback applied while no coordinator is armed, if this source needs one.
    fn default_disposition(&self) -> Option<Arc<DefaultDisposition>> {
        None
    }
}

/// Exits the process when a notification arrives and no coordinator is armed.
///
/// Shared by every coordinator using the same source. The watcher is spawned
/// on first arm and again if its runtime has gone away; it exits through the
/// exit function of the most recent arm.
pub struct DefaultDisposition {
    armed: AtomicUsize,
    exit: Mutex<Option<ExitFn>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl DefaultDisposition {
    /// A disposition with nothing armed and no watcher.
    pub fn new() -> Self {
        Self {
            armed: AtomicUsize::new(0),
            exit: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    /// Returns true while at least one coordinator is armed.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst) > 0
    }

    fn enter(
        self: &Arc<Self>,
        signals: &dyn SignalSource,
        exit: &ExitFn,
        handle: &tokio::runtime::Handle,
    ) {
        self.armed.fetch_add(1, Ordering::SeqCst);
        *self.exit.lock() = Some(Arc::clone(exit));

        let mut watcher = self.watcher.lock();
        if watcher.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let interrupts = signals.interrupts();
        let terminations = signals.terminations();
        *watcher = Some(handle.spawn(watch_unarmed(
            Arc::downgrade(self),
            interrupts,
            terminations,
        )));
    }

    fn leave(&self) {
        self.armed.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for DefaultDisposition {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DefaultDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultDisposition")
            .field("armed", &self.armed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn watch_unarmed(
    disposition: Weak<DefaultDisposition>,
    mut interrupts: BoxStream<'static, ()>,
    mut terminations: BoxStream<'static, ()>,
) {
    loop {
        let code = tokio::select! {
            Some(()) = interrupts.next() => INTERRUPT_EXIT_CODE,
            Some(()) = terminations.next() => TERMINATE_EXIT_CODE,
            else => return,
        };
        let Some(disposition) = disposition.upgrade() else {
            return;
        };
        if disposition.is_armed() {
            continue;
        }
        let exit = disposition.exit.lock().clone();
        if let Some(exit) = exit {
            tracing::debug!(code, "notification with nothing armed, exiting");
            exit(code);
        }
    }
}

static OS_DISPOSITION: Lazy<Arc<DefaultDisposition>> =
    Lazy::new(|| Arc::new(DefaultDisposition::new()));

/// Notifications from the operating system via `tokio::signal`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSignals;

#[cfg(unix)]
fn unix_signal_stream(kind: tokio::signal::unix::SignalKind) -> BoxStream<'static, ()> {
    match tokio::signal::unix::signal(kind) {
        Ok(signal) => stream::unfold(signal, |mut signal| async move {
            signal.recv().await.map(|()| ((), signal))
        })
        .boxed(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to install signal handler");
            stream::empty().boxed()
        }
    }
}

impl SignalSource for OsSignals {
    #[cfg(unix)]
    fn interrupts(&self) -> BoxStream<'static, ()> {
        unix_signal_stream(tokio::signal::unix::SignalKind::interrupt())
    }

    #[cfg(not(unix))]
    fn interrupts(&self) -> BoxStream<'static, ()> {
        stream::unfold((), |()| async {
            tokio::signal::ctrl_c().await.ok().map(|()| ((), ()))
        })
        .boxed()
    }

    #[cfg(unix)]
    fn terminations(&self) -> BoxStream<'static, ()> {
        unix_signal_stream(tokio::signal::unix::SignalKind::terminate())
    }

    #[cfg(not(unix))]
    fn terminations(&self) -> BoxStream<'static, ()> {
        stream::pending().boxed()
    }

    fn default_disposition(&self) -> Option<Arc<DefaultDisposition>> {
        Some(Arc::clone(&OS_DISPOSITION))
    }
}

/// Notifications delivered by hand.
///
/// Clones share subscribers, so a test keeps one clone and hands the other to
/// the pipeline.
#[derive(Debug, Clone, Default)]
pub struct ManualSignals {
    interrupts: Arc<Mutex<Vec<mpsc::UnboundedSender<()>>>>,
    terminations: Arc<Mutex<Vec<mpsc::UnboundedSender<()>>>>,
    disposition: Option<Arc<DefaultDisposition>>,
}

impl ManualSignals {
    /// Creates a source with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source that behaves like the OS once nothing is armed.
    ///
    /// The disposition's watcher stays subscribed after the first arm and is
    /// counted by [`active_listeners`](Self::active_listeners).
    pub fn with_default_disposition() -> Self {
        Self {
            disposition: Some(Arc::new(DefaultDisposition::new())),
            ..Self::default()
        }
    }

    /// Delivers an interrupt to every armed listener.
    pub fn interrupt(&self) {
        broadcast(&self.interrupts);
    }

    /// Delivers a terminate notification to every armed listener.
    pub fn terminate(&self) {
        broadcast(&self.terminations);
    }

    /// Number of listeners still subscribed.
    pub fn active_listeners(&self) -> usize {
        let open = |subscribers: &Mutex<Vec<mpsc::UnboundedSender<()>>>| {
            subscribers.lock().iter().filter(|s| !s.is_closed()).count()
        };
        open(&self.interrupts) + open(&self.terminations)
    }
}

fn broadcast(subscribers: &Mutex<Vec<mpsc::UnboundedSender<()>>>) {
    subscribers
        .lock()
        .retain(|sender| sender.unbounded_send(()).is_ok());
}

fn subscribe(subscribers: &Mutex<Vec<mpsc::UnboundedSender<()>>>) -> BoxStream<'static, ()> {
    let (sender, receiver) = mpsc::unbounded();
    subscribers.lock().push(sender);
    receiver.boxed()
}

impl SignalSource for ManualSignals {
    fn interrupts(&self) -> BoxStream<'static, ()> {
        subscribe(&self.interrupts)
    }

    fn terminations(&self) -> BoxStream<'static, ()> {
        subscribe(&self.terminations)
    }

    fn default_disposition(&self) -> Option<Arc<DefaultDisposition>> {
        self.disposition.clone()
    }
}

/// Function that ends the process with a status code.
pub type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

/// Configuration for termination handling.
#[derive(Clone)]
pub struct TerminationOptions {
    /// Where notifications come from.
    pub signals: Arc<dyn SignalSource>,
    /// How the process exits on the terminate path.
    pub exit: ExitFn,
    /// If set, an interrupt not followed by completion within this period
    /// exits with [`INTERRUPT_EXIT_CODE`].
    pub grace_period: Option<Duration>,
}

impl TerminationOptions {
    /// Uses `signals` instead of the OS.
    pub fn with_signals(mut self, signals: impl SignalSource + 'static) -> Self {
        self.signals = Arc::new(signals);
        self
    }

    /// Uses `exit` instead of [`std::process::exit`].
    pub fn with_exit(mut self, exit: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.exit = Arc::new(exit);
        self
    }

    /// Forces exit after `grace_period` once interrupted.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }
}

impl Default for TerminationOptions {
    fn default() -> Self {
        Self {
            signals: Arc::new(OsSignals),
            exit: Arc::new(|code: i32| std::process::exit(code)),
            grace_period: None,
        }
    }
}

impl fmt::Debug for TerminationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminationOptions")
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Closed,
    /// `None` when the invocation was torn down without a result code.
    Open(Option<i32>),
}

async fn wait_open(gate: &mut watch::Receiver<Gate>) -> Option<i32> {
    loop {
        let state = *gate.borrow_and_update();
        if let Gate::Open(code) = state {
            return code;
        }
        if gate.changed().await.is_err() {
            return None;
        }
    }
}

struct Armed {
    gate: watch::Sender<Gate>,
    interrupt_task: JoinHandle<()>,
    exit_task: JoinHandle<()>,
    exiting: Arc<AtomicBool>,
    disposition: Option<Arc<DefaultDisposition>>,
}

/// Bridges termination notifications into one invocation's cancellation.
pub struct TerminationCoordinator {
    options: TerminationOptions,
    token: CancellationToken,
    armed: Option<Armed>,
}

impl TerminationCoordinator {
    /// An idle coordinator.
    pub fn new(options: TerminationOptions) -> Self {
        Self {
            options,
            token: CancellationToken::new(),
            armed: None,
        }
    }

    /// Returns true once listeners are installed.
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Returns true if a notification cancelled the invocation.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Installs the listeners on first call and returns the token.
    ///
    /// Outside a tokio runtime no listeners can be spawned; the token is still
    /// returned but only cancelled by its holders.
    pub fn arm(&mut self) -> CancellationToken {
        if self.armed.is_none() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => self.armed = Some(self.spawn_listeners(&handle)),
                Err(_) => tracing::warn!("no tokio runtime, termination handling not armed"),
            }
        }
        self.token.clone()
    }

    fn spawn_listeners(&self, handle: &tokio::runtime::Handle) -> Armed {
        let disposition = self.options.signals.default_disposition();
        if let Some(disposition) = &disposition {
            disposition.enter(&*self.options.signals, &self.options.exit, handle);
        }

        let (gate, _) = watch::channel(Gate::Closed);
        let exiting = Arc::new(AtomicBool::new(false));

        let interrupt_task = {
            let mut interrupts = self.options.signals.interrupts();
            let token = self.token.clone();
            let grace_period = self.options.grace_period;
            let exit = Arc::clone(&self.options.exit);
            let gate_rx = gate.subscribe();
            handle.spawn(async move {
                let mut grace_started = false;
                while interrupts.next().await.is_some() {
                    tracing::debug!("interrupt received, cancelling invocation");
                    token.cancel();
                    if let (Some(period), false) = (grace_period, grace_started) {
                        grace_started = true;
                        tokio::spawn(force_exit_after(period, gate_rx.clone(), exit.clone()));
                    }
                }
            })
        };

        let exit_task = {
            let mut terminations = self.options.signals.terminations();
            let token = self.token.clone();
            let exit = Arc::clone(&self.options.exit);
            let mut gate_rx = gate.subscribe();
            let exiting = Arc::clone(&exiting);
            handle.spawn(async move {
                if terminations.next().await.is_none() {
                    return;
                }
                tracing::debug!("termination requested, waiting for invocation to finish");
                exiting.store(true, Ordering::SeqCst);
                token.cancel();
                let code = wait_open(&mut gate_rx).await.unwrap_or(1);
                tracing::debug!(code, "exiting after termination");
                exit(code);
            })
        };

        tracing::debug!("termination handling armed");
        Armed {
            gate,
            interrupt_task,
            exit_task,
            exiting,
            disposition,
        }
    }

    /// Tears down: stops listening and opens the gate with `code`.
    ///
    /// If a terminate notification is pending, this waits until the exit
    /// function has been called with `code`.
    pub async fn release(mut self, code: i32) {
        let Some(armed) = self.armed.take() else {
            return;
        };
        armed.interrupt_task.abort();
        armed.gate.send_replace(Gate::Open(Some(code)));
        if armed.exiting.load(Ordering::SeqCst) {
            let _ = armed.exit_task.await;
        } else {
            armed.exit_task.abort();
        }
        if let Some(disposition) = &armed.disposition {
            disposition.leave();
        }
        tracing::debug!(code, "termination handling released");
    }
}

async fn force_exit_after(period: Duration, mut gate: watch::Receiver<Gate>, exit: ExitFn) {
    tokio::select! {
        _ = wait_open(&mut gate) => {}
        _ = tokio::time::sleep(period) => {
            tracing::warn!(?period, "invocation did not finish after interrupt, forcing exit");
            exit(INTERRUPT_EXIT_CODE);
        }
    }
}

impl Drop for TerminationCoordinator {
    fn drop(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.interrupt_task.abort();
            armed.gate.send_replace(Gate::Open(None));
            if !armed.exiting.load(Ordering::SeqCst) {
                armed.exit_task.abort();
            }
            if let Some(disposition) = &armed.disposition {
                disposition.leave();
            }
            tracing::debug!("termination handling dropped without result code");
        }
    }
}

impl fmt::Debug for TerminationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminationCoordinator")
            .field("armed", &self.is_armed())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Installs a [`TerminationCoordinator`] into every invocation.
#[derive(Debug, Clone, Default)]
pub struct CancelOnTermination {
    options: TerminationOptions,
}

impl CancelOnTermination {
    /// Uses `options` for every invocation.
    pub fn new(options: TerminationOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Middleware for CancelOnTermination {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        ctx.install_termination(TerminationCoordinator::new(self.options.clone()));
        next.run(ctx).await
    }
}

impl PipelineBuilder {
    /// Cancels the invocation's token on interrupt or terminate.
    pub fn cancel_on_termination(self) -> Self {
        self.cancel_on_termination_with(TerminationOptions::default())
    }

    /// Cancels on termination with custom options.
    pub fn cancel_on_termination_with(mut self, options: TerminationOptions) -> Self {
        if !self.enable("cancel-on-termination") {
            return self;
        }
        self.add_middleware(Priority::Startup, CancelOnTermination::new(options))
    }
}
