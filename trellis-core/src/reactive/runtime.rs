//! Reactive Runtime
//!
//! The runtime is the entry point: it creates modules and owns the
//! scheduling task that applies every change to the graph.
//!
//! # How It Works
//!
//! 1. Handles (modules, variables) never touch the graph. They send a
//!    [`Command`] down an unbounded channel and return immediately.
//!
//! 2. The scheduling task wakes on the first command, yields once so the
//!    caller's synchronous burst of redefinitions can finish, then drains
//!    everything queued and applies it as one batch. While a [`Batch`] guard
//!    is open it keeps collecting instead.
//!
//! 3. One pass runs over the batch (see [`UpdateScheduler`]), under the
//!    write lock, so readers never observe a half-applied batch.
//!
//! 4. Asynchronous definitions and producers run as their own tasks and
//!    report back through the same channel.
//!
//! # Thread Safety
//!
//! The scheduler state sits behind a `parking_lot::RwLock`. Only the
//! scheduling task writes; handle getters take short read locks. Synchronous
//! definitions and producer cleanups run while the write lock is held, so
//! they must not read variable handles.
//!
//! The single yield only separates bursts when the caller and the scheduling
//! task share a thread (a current-thread runtime). On a multi-threaded
//! runtime the scheduling task may wake on another worker mid-burst, so
//! redefinitions that must land together go inside [`Runtime::batch`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use super::module::Module;
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::graph::{Command, ModuleId, UpdateScheduler};

pub(crate) type SharedScheduler = Arc<RwLock<UpdateScheduler>>;

/// Number of open [`Batch`] guards.
#[derive(Debug, Default)]
struct BatchGate(AtomicUsize);

impl BatchGate {
    fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

struct RuntimeInner {
    scheduler: SharedScheduler,
    commands: UnboundedSender<Command>,
    gate: Arc<BatchGate>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Dispose);
    }
}

/// A reactive dataflow runtime.
///
/// Cloning is cheap and yields another handle to the same runtime. When the
/// last handle (including module and variable handles) is dropped, every
/// producer is finalized and the scheduling task stops.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn with_config(config: RuntimeConfig) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let scheduler = Arc::new(RwLock::new(UpdateScheduler::new(commands.clone(), &config)));
        let gate = Arc::new(BatchGate::default());
        tokio::spawn(schedule(Arc::clone(&scheduler), Arc::clone(&gate), receiver));
        tracing::debug!(frame_interval_ms = config.frame_interval_ms, "runtime started");

        Self {
            inner: Arc::new(RuntimeInner {
                scheduler,
                commands,
                gate,
            }),
        }
    }

    /// Create a new, empty module.
    pub fn module(&self) -> Module {
        Module::new(self.clone(), ModuleId::new())
    }

    /// Hold back the next pass until the returned guard is dropped.
    ///
    /// Every change made while any guard is alive is applied in one batch.
    /// Do not await [`flush`](Runtime::flush) or a variable's value while
    /// holding a guard: the pass it waits for cannot run.
    ///
    /// ```rust,ignore
    /// let batch = runtime.batch();
    /// foo.define("foo", &["baz"], identity);
    /// baz.define("baz", &["bar"], identity);
    /// drop(batch);
    /// ```
    pub fn batch(&self) -> Batch {
        self.inner.gate.0.fetch_add(1, Ordering::SeqCst);
        Batch {
            runtime: self.clone(),
        }
    }

    /// Wait until every change requested so far has been applied and the
    /// resulting pass has completed.
    pub async fn flush(&self) -> Result<(), RuntimeError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Flush(reply))?;
        done.await.map_err(|_| RuntimeError::Detached)
    }

    /// Finalize every producer, cancel all in-flight work and stop the
    /// scheduling task. Variables become detached.
    pub async fn dispose(&self) {
        if self.send(Command::Dispose).is_ok() {
            let _ = self.flush().await;
        }
    }

    pub(crate) fn send(&self, command: Command) -> Result<(), RuntimeError> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| RuntimeError::Detached)
    }

    pub(crate) fn scheduler(&self) -> &SharedScheduler {
        &self.inner.scheduler
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheduler = self.inner.scheduler.read();
        f.debug_struct("Runtime")
            .field("variables", &scheduler.node_count())
            .field("disposed", &scheduler.is_disposed())
            .finish()
    }
}

/// Keeps the scheduler collecting changes while alive. See [`Runtime::batch`].
#[must_use = "the batch closes as soon as the guard is dropped"]
pub struct Batch {
    runtime: Runtime,
}

impl Drop for Batch {
    fn drop(&mut self) {
        if self.runtime.inner.gate.0.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.runtime.send(Command::Wake);
        }
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch").finish_non_exhaustive()
    }
}

/// The scheduling task: one batch, one pass, per wake-up.
async fn schedule(
    scheduler: SharedScheduler,
    gate: Arc<BatchGate>,
    mut commands: UnboundedReceiver<Command>,
) {
    while let Some(first) = commands.recv().await {
        // Next tick: let the sender's synchronous burst land first.
        tokio::task::yield_now().await;

        let mut batch = vec![first];
        loop {
            while let Ok(command) = commands.try_recv() {
                batch.push(command);
            }
            let disposing = batch.iter().any(|command| matches!(command, Command::Dispose));
            if disposing || !gate.is_open() {
                break;
            }
            match commands.recv().await {
                Some(command) => batch.push(command),
                None => break,
            }
        }
        // Anything sent before the last guard closed.
        while let Ok(command) = commands.try_recv() {
            batch.push(command);
        }

        let (flushes, disposed) = {
            let mut scheduler = scheduler.write();
            let size = batch.len();
            for command in batch {
                scheduler.apply(command);
            }
            scheduler.run_pass();
            tracing::trace!(size, "batch applied");
            (scheduler.take_flushes(), scheduler.is_disposed())
        };

        for flush in flushes {
            let _ = flush.send(());
        }
        if disposed {
            break;
        }
    }
    tracing::debug!("scheduling task stopped");
}
