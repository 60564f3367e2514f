use std::fmt;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use crate::error::Error;
use crate::timer::Timer;

pub use channel::Rx;
pub use failure::{Failure, Kind};

mod channel;
mod failure;
mod queue;

/// A single-assignment value shared between one settling side and any
/// number of observers.
///
/// Clones refer to the same underlying state. The first call to
/// [`fulfill`](Self::fulfill), [`reject`](Self::reject) or
/// [`settle`](Self::settle) wins; every later call returns
/// [`Error::AlreadySettled`] and leaves the delivered outcome untouched.
///
/// Continuations never run inline with the call that registers or settles
/// them. They are appended to the current thread's run queue and drained
/// in FIFO order by the outermost frame, so chains of any length settle
/// without growing the stack.
///
/// Ordering holds per run queue. Continuations waiting at settlement run
/// in attachment order on the settling thread. A continuation attached
/// after settlement runs on the attaching thread's queue and is not
/// ordered against continuations still draining on another thread.
///
/// A `Deferred` that is never settled keeps its continuations alive for as
/// long as some clone exists, and they never run. Dropping the last clone
/// of a pending `Deferred` with waiting continuations logs a warning.
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

/// Snapshot of a [`Deferred`]'s state.
#[derive(Clone, Debug, PartialEq)]
pub enum State<T> {
    Pending,
    Fulfilled(T),
    Rejected(Failure),
}

type Callback<T> = Box<dyn FnOnce(Result<T, Failure>) + Send>;

struct Shared<T> {
    id:    u64,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    state:   State<T>,
    waiting: Vec<Callback<T>>,
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

impl<T: Clone + Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        let id    = COUNTER.fetch_add(1, Ordering::Relaxed);
        let inner = Inner {
            state:   State::Pending,
            waiting: Vec::new(),
        };

        Self {
            shared: Arc::new(Shared {
                id:    id,
                inner: Mutex::new(inner),
            }),
        }
    }

    /// Create a `Deferred` that is already settled with `result`.
    pub fn settled(result: Result<T, Failure>) -> Self {
        let deferred = Self::new();
        deferred.transition(result);
        deferred
    }

    pub fn fulfill(&self, value: T) -> Result<(), Error> {
        self.settle(Ok(value))
    }

    pub fn reject(&self, failure: Failure) -> Result<(), Error> {
        self.settle(Err(failure))
    }

    pub fn settle(&self, result: Result<T, Failure>) -> Result<(), Error> {
        match self.transition(result) {
            true  => Ok(()),
            false => Err(Error::AlreadySettled),
        }
    }

    /// Fulfill with the value of `producer` once at least `delay` has
    /// elapsed on `timer`.
    pub fn schedule<M, P>(&self, timer: &M, delay: Duration, producer: P)
    where
        M: Timer + ?Sized,
        P: FnOnce() -> T + Send + 'static,
    {
        let deferred = self.clone();
        timer.after(delay, Box::new(move || {
            let result = catch(move || Ok(producer()));
            if deferred.settle(result).is_err() {
                debug!(id = deferred.id(), "scheduled value discarded");
            }
        }));
    }

    /// Register `callback` to receive the outcome. This is the primitive
    /// every other form of observation is built on.
    ///
    /// If the `Deferred` has already settled, `callback` is queued on the
    /// calling thread rather than on the thread that settled it.
    pub fn on_settled<F>(&self, callback: F)
    where
        F: FnOnce(Result<T, Failure>) + Send + 'static,
    {
        let result = {
            let mut inner = self.shared.lock();
            match inner.outcome() {
                Some(result) => result,
                None         => return inner.waiting.push(Box::new(callback)),
            }
        };
        queue::submit(vec![Box::new(move || callback(result))]);
    }

    /// Attach a continuation pair and return the derived `Deferred`.
    ///
    /// An `Err` returned by either callback, or a panic inside it, rejects
    /// the derived `Deferred`.
    pub fn observe<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, Failure> + Send + 'static,
        R: FnOnce(Failure) -> Result<U, Failure> + Send + 'static,
    {
        let derived = Deferred::new();
        let target  = derived.clone();

        self.on_settled(move |result| {
            let result = match result {
                Ok(value)    => catch(move || on_fulfilled(value)),
                Err(failure) => catch(move || on_rejected(failure)),
            };
            target.transition(result);
        });

        derived
    }

    /// Like [`observe`](Self::observe) without a rejection handler: a
    /// rejection reaches the derived `Deferred` unchanged.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, Failure> + Send + 'static,
    {
        self.observe(on_fulfilled, Err)
    }

    /// Settle `target` with this `Deferred`'s outcome.
    pub fn forward(&self, target: &Deferred<T>) {
        let target = target.clone();
        self.on_settled(move |result| {
            if target.settle(result).is_err() {
                debug!(id = target.id(), "forwarded outcome discarded");
            }
        });
    }

    pub fn receiver(&self) -> Rx<T> {
        let (tx, rx) = channel::oneshot();
        self.on_settled(move |result| tx.send(result));
        rx
    }

    pub fn state(&self) -> State<T> {
        self.shared.lock().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.shared.lock().state, State::Pending)
    }

    fn transition(&self, result: Result<T, Failure>) -> bool {
        let waiting = {
            let mut inner = self.shared.lock();
            if !matches!(inner.state, State::Pending) {
                return false;
            }
            inner.state = match &result {
                Ok(value)    => State::Fulfilled(value.clone()),
                Err(failure) => State::Rejected(failure.clone()),
            };
            mem::take(&mut inner.waiting)
        };

        if let Err(failure) = &result {
            if waiting.is_empty() {
                warn!(id = self.id(), kind = ?failure.kind(), "unhandled rejection: {failure}");
            }
        }

        let jobs = waiting.into_iter().map(|callback| {
            let result = result.clone();
            Box::new(move || callback(result)) as queue::Job
        }).collect::<Vec<_>>();

        queue::submit(jobs);

        true
    }
}

impl<T> Deferred<T> {
    /// Identity shared by all clones of this `Deferred`.
    pub fn id(&self) -> u64 {
        self.shared.id
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Inner<T> {
    fn outcome(&self) -> Option<Result<T, Failure>> {
        match &self.state {
            State::Pending            => None,
            State::Fulfilled(value)   => Some(Ok(value.clone())),
            State::Rejected(failure)  => Some(Err(failure.clone())),
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if matches!(inner.state, State::Pending) && !inner.waiting.is_empty() {
            let waiting = inner.waiting.len();
            warn!(id = self.id, waiting, "deferred dropped while pending");
        }
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Deferred")
            .field("id", &self.shared.id)
            .field("state", &inner.state)
            .finish()
    }
}

/// Run a user callback, turning a panic into a `Panic` failure.
pub(crate) fn catch<U>(f: impl FnOnce() -> Result<U, Failure>) -> Result<U, Failure> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(Failure::panic(panic.as_ref())),
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::sync::mpsc;
    use std::thread;
    use serde_json::{json, Value};
    use super::*;

    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl Logs {
        fn capture(f: impl FnOnce()) -> String {
            let logs   = Logs::default();
            let writer = logs.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .finish();
            tracing::subscriber::with_default(subscriber, f);
            let bytes = logs.0.lock().unwrap().clone();
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    impl io::Write for Logs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn record<T: Clone + Send + 'static>(deferred: &Deferred<T>) -> mpsc::Receiver<Result<T, Failure>> {
        let (tx, rx) = mpsc::channel();
        deferred.on_settled(move |result| {
            let _ = tx.send(result);
        });
        rx
    }

    #[test]
    fn settles_exactly_once() {
        let deferred = Deferred::new();
        let outcome  = record(&deferred);

        assert_eq!(deferred.fulfill(1), Ok(()));
        assert_eq!(deferred.fulfill(2), Err(Error::AlreadySettled));
        assert_eq!(deferred.reject(Failure::error("late")), Err(Error::AlreadySettled));

        assert_eq!(deferred.state(), State::Fulfilled(1));
        assert_eq!(outcome.try_recv(), Ok(Ok(1)));
        assert!(outcome.try_recv().is_err());
    }

    #[test]
    fn first_rejection_wins() {
        let deferred = Deferred::<u32>::new();

        assert_eq!(deferred.reject(Failure::error("first")), Ok(()));
        assert_eq!(deferred.fulfill(7), Err(Error::AlreadySettled));

        match deferred.state() {
            State::Rejected(failure) => assert_eq!(failure.message(), "first"),
            state                    => panic!("unexpected state {state:?}"),
        }
    }

    #[test]
    fn continuations_run_in_attachment_order() {
        let deferred = Deferred::new();
        let (tx, rx) = mpsc::channel();

        for n in 0..5 {
            let tx = tx.clone();
            deferred.on_settled(move |result: Result<&str, Failure>| {
                let _ = tx.send((n, result));
            });
        }

        assert!(rx.try_recv().is_err());
        deferred.fulfill("v").unwrap();

        let order = rx.try_iter().collect::<Vec<_>>();
        assert_eq!(order, (0..5).map(|n| (n, Ok("v"))).collect::<Vec<_>>());
    }

    #[test]
    fn late_attachment_sees_outcome() {
        let deferred = Deferred::settled(Ok(json!("done")));
        let outcome  = record(&deferred);
        assert_eq!(outcome.try_recv(), Ok(Ok(json!("done"))));

        let rejected = Deferred::<Value>::settled(Err(Failure::error("gone")));
        let outcome  = record(&rejected);
        assert_eq!(outcome.try_recv(), Ok(Err(Failure::error("gone"))));
    }

    #[test]
    fn late_attachment_queues_behind_running_continuations() {
        let deferred = Deferred::new();
        let (tx, rx) = mpsc::channel();

        let inner = deferred.clone();
        let first = tx.clone();
        deferred.on_settled(move |_: Result<u8, Failure>| {
            let late = first.clone();
            inner.on_settled(move |_| {
                let _ = late.send("late");
            });
            let _ = first.send("first");
        });

        let second = tx.clone();
        deferred.on_settled(move |_| {
            let _ = second.send("second");
        });

        deferred.fulfill(0).unwrap();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), ["first", "second", "late"]);
    }

    #[test]
    fn rejection_propagates_without_handler() {
        let deferred = Deferred::<String>::new();
        let derived  = deferred.then(|value| Ok(value.len()));

        deferred.reject(Failure::thrown(json!("abc"))).unwrap();

        assert_eq!(derived.state(), State::Rejected(Failure::thrown(json!("abc"))));
    }

    #[test]
    fn transforms_value_and_error() {
        let fulfilled = Deferred::settled(Ok("abc".to_owned()));
        let repeated  = fulfilled.then(|value| Ok(value.repeat(3)));
        assert_eq!(repeated.state(), State::Fulfilled("abcabcabc".to_owned()));

        let rejected = Deferred::<String>::settled(Err(Failure::thrown(json!("abc"))));
        let mapped   = rejected.observe(Ok, |failure| {
            Err(Failure::thrown(json!(failure.message().repeat(3))))
        });
        assert_eq!(mapped.state(), State::Rejected(Failure::thrown(json!("abcabcabc"))));

        let thrown = Deferred::settled(Ok("abc".to_owned()));
        let mapped = thrown.then::<String, _>(|value| Err(Failure::error(value.repeat(3))));
        assert_eq!(mapped.state(), State::Rejected(Failure::error("abcabcabc")));
    }

    #[test]
    fn rejection_handler_recovers() {
        let deferred = Deferred::<u32>::new();
        let derived  = deferred.observe(|n| Ok(n * 2), |_| Ok(0));

        deferred.reject(Failure::error("nope")).unwrap();
        assert_eq!(derived.state(), State::Fulfilled(0));
    }

    #[test]
    fn panicking_continuation_rejects_derived() {
        let deferred = Deferred::<u32>::new();
        let derived  = deferred.then::<u32, _>(|_| panic!("kaboom"));

        deferred.fulfill(1).unwrap();

        match derived.state() {
            State::Rejected(failure) => {
                assert_eq!(failure.kind(), Kind::Panic);
                assert_eq!(failure.message(), "kaboom");
            }
            state => panic!("unexpected state {state:?}"),
        }
    }

    #[test]
    fn long_chains_do_not_recurse() {
        let root = Deferred::<u64>::new();

        let mut last = root.clone();
        for _ in 0..50_000 {
            last = last.then(|n| Ok(n + 1));
        }

        root.fulfill(0).unwrap();
        assert_eq!(last.state(), State::Fulfilled(50_000));
    }

    #[test]
    fn reentrant_settlement_is_queued() {
        let first  = Deferred::<u32>::new();
        let second = Deferred::<u32>::new();
        let (tx, rx) = mpsc::channel();

        let other = second.clone();
        let log   = tx.clone();
        first.on_settled(move |result| {
            other.fulfill(result.unwrap_or_default() + 1).unwrap();
            let _ = log.send("first settled second");
        });

        second.on_settled(move |_| {
            let _ = tx.send("second observed");
        });

        first.fulfill(1).unwrap();

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), ["first settled second", "second observed"]);
        assert_eq!(second.state(), State::Fulfilled(2));
    }

    #[test]
    fn concurrent_observers_all_run_once() {
        let deferred = Deferred::<u32>::new();
        let (tx, rx) = mpsc::channel();

        let threads = (0..8).map(|_| {
            let deferred = deferred.clone();
            let tx       = tx.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let tx = tx.clone();
                    deferred.on_settled(move |result| {
                        let _ = tx.send(result);
                    });
                }
            })
        }).collect::<Vec<_>>();

        deferred.fulfill(9).unwrap();

        for thread in threads {
            thread.join().unwrap();
        }
        drop(tx);

        let seen = rx.iter().collect::<Vec<_>>();
        assert_eq!(seen.len(), 800);
        assert!(seen.iter().all(|result| result == &Ok(9)));
    }

    #[test]
    fn late_attachment_runs_on_attaching_thread() {
        let deferred = Deferred::settled(Ok(5u8));
        let (tx, rx) = mpsc::channel();

        let observer = deferred.clone();
        let attached = thread::spawn(move || {
            observer.on_settled(move |result| {
                let _ = tx.send((thread::current().id(), result));
            });
            thread::current().id()
        }).join().unwrap();

        assert_eq!(rx.recv().unwrap(), (attached, Ok(5)));
    }

    #[test]
    fn identity_is_shared_by_clones() {
        let deferred = Deferred::<u8>::new();
        let clone    = deferred.clone();

        assert_eq!(deferred.id(), clone.id());
        assert_ne!(deferred.id(), Deferred::<u8>::new().id());

        clone.fulfill(3).unwrap();
        assert_eq!(deferred.state(), State::Fulfilled(3));
    }

    #[test]
    fn receiver_yields_outcome() {
        let deferred = Deferred::new();
        let rx       = deferred.receiver();

        let settler = deferred.clone();
        let thread  = thread::spawn(move || settler.fulfill(json!({"ok": true})));

        assert_eq!(rx.recv(), Ok(json!({"ok": true})));
        assert_eq!(thread.join().unwrap(), Ok(()));
    }

    #[test]
    fn receiver_reports_rejection() {
        let deferred = Deferred::<Value>::settled(Err(Failure::error("boom")));
        assert_eq!(deferred.receiver().recv(), Err(Error::Rejected(Failure::error("boom"))));
    }

    #[test]
    fn dropped_pending_receiver_is_abandoned() {
        let deferred = Deferred::<u8>::new();
        let rx       = deferred.receiver();

        drop(deferred);

        assert_eq!(rx.recv(), Err(Error::Abandoned));
    }

    #[test]
    fn warns_on_unhandled_rejection() {
        let logs = Logs::capture(|| {
            let deferred = Deferred::<u8>::new();
            deferred.reject(Failure::error("nobody listening")).unwrap();
        });
        assert!(logs.contains("unhandled rejection: nobody listening"), "{logs}");
    }

    #[test]
    fn observed_rejection_is_not_reported() {
        let logs = Logs::capture(|| {
            let deferred = Deferred::<u8>::new();
            let rx       = record(&deferred);
            deferred.reject(Failure::error("seen")).unwrap();
            assert_eq!(rx.recv().unwrap(), Err(Failure::error("seen")));
        });
        assert!(!logs.contains("unhandled rejection"), "{logs}");
    }

    #[test]
    fn warns_when_dropped_while_pending() {
        let logs = Logs::capture(|| {
            let deferred = Deferred::<u8>::new();
            deferred.on_settled(|_| ());
            drop(deferred);
        });
        assert!(logs.contains("deferred dropped while pending"), "{logs}");
    }

    #[test]
    fn dropping_unobserved_pending_is_quiet() {
        let logs = Logs::capture(|| drop(Deferred::<u8>::new()));
        assert!(!logs.contains("deferred dropped while pending"), "{logs}");
    }
}
