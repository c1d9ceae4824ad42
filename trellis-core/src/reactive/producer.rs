//! Producers and the Producer Driver
//!
//! A producer is a definition whose value changes over time: a clock, a
//! stream of sensor readings, an animation. It may hold resources that must
//! be released when nobody needs the value any more.
//!
//! # Driving
//!
//! Each active producer gets one [`ProducerDriver`], a tokio task that:
//!
//! 1. Requests the next value and waits for it.
//! 2. Publishes it to the scheduler, tagged with the variable's generation.
//! 3. Waits one frame, then goes back to 1.
//!
//! When the producer reports it is finished, the driver deactivates quietly:
//! the producer already ran its own cleanup on the way out. When it fails
//! (an `Err` or a panic), the failure is published and the producer is
//! terminated.
//!
//! # Finalization
//!
//! The producer lives in a slot shared between the driver task and every
//! [`ProducerHandle`]. Finalizing means taking it out of the slot under the
//! lock and calling [`Producer::terminate`] on it. Whoever takes it first
//! finalizes; everybody else finds an empty slot. That is what collapses
//! "the variable became unreachable", "the variable was redefined" and "a
//! debugger pulled the plug" into one cleanup call.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::definition::{guarded, guarded_future};
use crate::error::DefinitionError;
use crate::graph::{Command, VariableId};

type Cleanup = Box<dyn FnOnce() + Send>;

/// A source of values over time.
pub trait Producer: Send + 'static {
    /// Request the next value.
    ///
    /// Resolves to `None` once the producer is finished, in which case any
    /// cleanup has already run. An `Err` is terminal: the driver publishes it,
    /// stops asking and calls [`terminate`](Producer::terminate).
    fn next(&mut self) -> BoxFuture<'static, Option<Result<Value, DefinitionError>>>;

    /// Stop early and release resources. Must run cleanup synchronously and
    /// must be idempotent, including after natural completion.
    fn terminate(&mut self);
}

/// Runs a cleanup closure at most once.
#[derive(Clone, Default)]
struct CleanupSlot(Arc<Mutex<Option<Cleanup>>>);

impl CleanupSlot {
    fn set(&self, cleanup: Cleanup) {
        *self.0.lock() = Some(cleanup);
    }

    fn run(&self) {
        let cleanup = self.0.lock().take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}

/// A producer over an iterator, with an optional `finally` block.
///
/// ```rust,ignore
/// let ticks = Generator::new((0..).map(Value::from)).on_return(|| println!("done"));
/// ```
pub struct Generator {
    iter: Option<Box<dyn Iterator<Item = Value> + Send>>,
    cleanup: CleanupSlot,
}

impl Generator {
    /// Wrap an iterator.
    pub fn new<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self {
            iter: Some(Box::new(iter.into_iter())),
            cleanup: CleanupSlot::default(),
        }
    }

    /// Run `cleanup` when the generator finishes or is terminated.
    pub fn on_return<F>(self, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup.set(Box::new(cleanup));
        self
    }
}

impl Producer for Generator {
    fn next(&mut self) -> BoxFuture<'static, Option<Result<Value, DefinitionError>>> {
        let item = self.iter.as_mut().and_then(|iter| iter.next());
        if item.is_none() {
            self.iter = None;
            self.cleanup.run();
        }
        future::ready(item.map(Ok)).boxed()
    }

    fn terminate(&mut self) {
        self.iter = None;
        self.cleanup.run();
    }
}

/// A producer over an asynchronous stream, for sources that suspend between
/// values.
pub struct StreamProducer {
    stream: Arc<tokio::sync::Mutex<BoxStream<'static, Value>>>,
    cleanup: CleanupSlot,
}

impl StreamProducer {
    /// Wrap a stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        Self {
            stream: Arc::new(tokio::sync::Mutex::new(stream.boxed())),
            cleanup: CleanupSlot::default(),
        }
    }

    /// Run `cleanup` when the stream ends or the producer is terminated.
    pub fn on_return<F>(self, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup.set(Box::new(cleanup));
        self
    }
}

impl Producer for StreamProducer {
    fn next(&mut self) -> BoxFuture<'static, Option<Result<Value, DefinitionError>>> {
        let stream = Arc::clone(&self.stream);
        let cleanup = self.cleanup.clone();
        async move {
            let item = stream.lock().await.next().await;
            if item.is_none() {
                cleanup.run();
            }
            item.map(Ok)
        }
        .boxed()
    }

    fn terminate(&mut self) {
        self.cleanup.run();
    }
}

type ProducerSlot = Arc<Mutex<Option<Box<dyn Producer>>>>;

/// The live producer of a variable, as exposed to observers.
#[derive(Clone)]
pub struct ProducerHandle {
    slot: ProducerSlot,
}

impl ProducerHandle {
    /// Whether the producer is still live.
    pub fn is_active(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Force early termination. Returns `true` if this call ran the
    /// finalization, `false` if the producer was already finished.
    pub fn terminate(&self) -> bool {
        // Take it out before calling into user code so cleanup runs unlocked.
        let producer = self.slot.lock().take();
        match producer {
            Some(mut producer) => {
                producer.terminate();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ProducerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Drives one producer for one generation of one variable.
#[derive(Debug)]
pub struct ProducerDriver {
    handle: ProducerHandle,
    task: JoinHandle<()>,
}

impl ProducerDriver {
    /// Spawn a driver task for `producer`.
    ///
    /// Values are reported as [`Command::Produced`] and completion as
    /// [`Command::ProducerFinished`], both stamped with `generation`.
    pub fn start(
        producer: Box<dyn Producer>,
        variable: VariableId,
        generation: u64,
        commands: UnboundedSender<Command>,
        frame_interval: Duration,
    ) -> Self {
        let handle = ProducerHandle {
            slot: Arc::new(Mutex::new(Some(producer))),
        };
        let task = tokio::spawn(drive(
            handle.clone(),
            variable,
            generation,
            commands,
            frame_interval,
        ));
        Self { handle, task }
    }

    /// A handle to the producer for observers.
    pub fn handle(&self) -> ProducerHandle {
        self.handle.clone()
    }

    /// Whether the producer is still live.
    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    /// Finalize the producer (if still live) and stop the driver task.
    pub fn stop(self) -> bool {
        let finalized = self.handle.terminate();
        self.task.abort();
        finalized
    }
}

async fn drive(
    handle: ProducerHandle,
    variable: VariableId,
    generation: u64,
    commands: UnboundedSender<Command>,
    frame_interval: Duration,
) {
    loop {
        let next = match handle.slot.lock().as_mut() {
            Some(producer) => guarded(|| Ok(producer.next())),
            None => return,
        };
        let item = match next {
            Ok(next) => guarded_future(next.map(Ok)).await,
            Err(error) => Err(error),
        };

        match item.unwrap_or_else(|error| Some(Err(error))) {
            Some(outcome) => {
                // Terminated while we were suspended.
                if !handle.is_active() {
                    return;
                }
                let terminal = outcome.is_err();
                tracing::trace!(?variable, generation, "producer yielded");
                let sent = commands.send(Command::Produced {
                    variable,
                    generation,
                    outcome,
                });
                if sent.is_err() {
                    return;
                }
                if terminal {
                    finish(&handle, variable, generation, &commands, true);
                    return;
                }
            }
            None => {
                finish(&handle, variable, generation, &commands, false);
                return;
            }
        }

        if frame_interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(frame_interval).await;
        }
    }
}

/// Deactivate the driver. A producer that failed is terminated; one that
/// completed naturally has already cleaned up and is just dropped.
fn finish(
    handle: &ProducerHandle,
    variable: VariableId,
    generation: u64,
    commands: &UnboundedSender<Command>,
    failed: bool,
) {
    let finished = handle.slot.lock().take();
    if let (true, Some(mut producer)) = (failed, finished) {
        producer.terminate();
    }
    tracing::trace!(?variable, generation, "producer finished");
    let _ = commands.send(Command::ProducerFinished {
        variable,
        generation,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        (count, move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn generator_runs_cleanup_on_completion() {
        let (cleanups, cleanup) = counter();
        let mut generator = Generator::new(vec![json!(1), json!(2)]).on_return(cleanup);

        assert_eq!(generator.next().await, Some(Ok(json!(1))));
        assert_eq!(generator.next().await, Some(Ok(json!(2))));
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
        assert_eq!(generator.next().await, None);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        // Terminating a finished generator is a no-op.
        generator.terminate();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn generator_terminate_is_idempotent() {
        let (cleanups, cleanup) = counter();
        let mut generator = Generator::new(std::iter::repeat(json!(1))).on_return(cleanup);

        generator.terminate();
        generator.terminate();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handle_terminates_once() {
        let (cleanups, cleanup) = counter();
        let (tx, _rx) = mpsc::unbounded_channel();
        let producer = Generator::new(std::iter::repeat(json!(1))).on_return(cleanup);
        let driver = ProducerDriver::start(
            Box::new(producer),
            VariableId::from(0),
            1,
            tx,
            Duration::from_millis(1),
        );

        let handle = driver.handle();
        assert!(handle.is_active());
        assert!(handle.terminate());
        assert!(!handle.terminate());
        assert!(!driver.stop());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn driver_publishes_values_then_finishes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let variable = VariableId::from(7);
        let _driver = ProducerDriver::start(
            Box::new(Generator::new(vec![json!("a"), json!("b")])),
            variable,
            4,
            tx,
            Duration::ZERO,
        );

        let mut produced = Vec::new();
        while let Some(command) = rx.recv().await {
            match command {
                Command::Produced {
                    variable: v,
                    generation,
                    outcome,
                } => {
                    assert_eq!(v, variable);
                    assert_eq!(generation, 4);
                    produced.push(outcome.unwrap());
                }
                Command::ProducerFinished { generation, .. } => {
                    assert_eq!(generation, 4);
                    break;
                }
                other => panic!("unexpected command {other:?}"),
            }
        }
        assert_eq!(produced, vec![json!("a"), json!("b")]);
    }

    /// Collect what the driver reports until it finishes.
    async fn drain(rx: &mut mpsc::UnboundedReceiver<Command>) -> Vec<Result<Value, DefinitionError>> {
        let mut produced = Vec::new();
        while let Some(command) = rx.recv().await {
            match command {
                Command::Produced { outcome, .. } => produced.push(outcome),
                Command::ProducerFinished { .. } => break,
                other => panic!("unexpected command {other:?}"),
            }
        }
        produced
    }

    #[tokio::test]
    async fn panicking_generator_is_published_as_an_error() {
        let (cleanups, cleanup) = counter();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut calls = 0;
        let generator = Generator::new(std::iter::from_fn(move || {
            calls += 1;
            if calls > 1 {
                panic!("gen boom");
            }
            Some(json!(1))
        }))
        .on_return(cleanup);
        let driver = ProducerDriver::start(
            Box::new(generator),
            VariableId::from(2),
            1,
            tx,
            Duration::ZERO,
        );

        assert_eq!(
            drain(&mut rx).await,
            vec![Ok(json!(1)), Err(DefinitionError::thrown("gen boom"))]
        );
        assert!(!driver.is_active());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    /// A producer whose only cleanup is `terminate`.
    struct Failing {
        terminated: Arc<AtomicUsize>,
    }

    impl Producer for Failing {
        fn next(&mut self) -> BoxFuture<'static, Option<Result<Value, DefinitionError>>> {
            future::ready(Some(Err(DefinitionError::thrown("sensor offline")))).boxed()
        }

        fn terminate(&mut self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn failed_producer_is_terminated_once() {
        let terminated = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let driver = ProducerDriver::start(
            Box::new(Failing {
                terminated: terminated.clone(),
            }),
            VariableId::from(3),
            1,
            tx,
            Duration::ZERO,
        );

        assert_eq!(
            drain(&mut rx).await,
            vec![Err(DefinitionError::thrown("sensor offline"))]
        );
        assert!(!driver.stop());
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminating_a_suspended_stream_runs_cleanup_immediately() {
        let (cleanups, cleanup) = counter();
        let (tx, _rx) = mpsc::unbounded_channel();
        let producer = StreamProducer::new(futures_util::stream::pending()).on_return(cleanup);
        let driver = ProducerDriver::start(
            Box::new(producer),
            VariableId::from(1),
            1,
            tx,
            Duration::ZERO,
        );

        // Let the driver park on the pending stream.
        tokio::task::yield_now().await;

        assert!(driver.stop());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }
}
