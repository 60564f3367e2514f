//! Boundary-safe access to host [`Deferred`]s.
//!
//! A foreign caller never holds a `Deferred` directly. It holds a
//! [`Handle`], a plain id that serializes to a JSON number, and chains onto
//! it by naming continuations that live on either side of the boundary.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};
use crate::defer::{self, Deferred, Failure};
use crate::error::Error;
use crate::vm::{Arg, Function};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u64);

/// A callback invoked with the outcome of the `Deferred` it is attached to.
///
/// Its own result is a `Deferred`, so a continuation may finish later, as a
/// JavaScript function returning a promise does. `Err` means the call never
/// reached the other side.
pub trait Continuation: Send + Sync + 'static {
    fn invoke(&self, input: Result<Value, Failure>) -> Result<Deferred<Value>>;
}

/// Host-side continuation.
pub struct Native<F>(pub F);

#[derive(Clone, Default)]
pub struct Bridge {
    registry: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    counter: u64,
    exposed: HashMap<u64, Handle>,
    entries: HashMap<Handle, Deferred<Value>>,
    faults:  HashMap<Handle, String>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exposing the same `Deferred` again returns the same `Handle`.
    ///
    /// The bridge holds a clone of every exposed `Deferred` until its
    /// handle is passed to [`release`](Self::release).
    pub fn expose(&self, deferred: &Deferred<Value>) -> Handle {
        let mut registry = self.lock();

        if let Some(handle) = registry.exposed.get(&deferred.id()) {
            return *handle;
        }

        let handle = Handle(registry.counter);
        registry.counter += 1;
        registry.exposed.insert(deferred.id(), handle);
        registry.entries.insert(handle, deferred.clone());

        debug!(%handle, deferred = deferred.id(), "exposed");

        handle
    }

    /// Chain a continuation pair onto `handle`, returning the handle of the
    /// derived `Deferred`. Without `on_rejected` a rejection passes through
    /// unchanged.
    ///
    /// When a continuation cannot be delivered the derived `Deferred` stays
    /// pending and the failure is kept for [`fault`](Self::fault).
    ///
    /// The derived handle is registered like any exposed one and stays
    /// resolvable, settled or not, until it is released. Callers that chain
    /// indefinitely must release handles they no longer need.
    pub fn attach(
        &self,
        handle:       Handle,
        on_fulfilled: Box<dyn Continuation>,
        on_rejected:  Option<Box<dyn Continuation>>,
    ) -> Result<Handle, Error> {
        let source  = self.deferred(handle).ok_or(Error::UnknownHandle(handle.0))?;
        let derived = Deferred::new();
        let target  = self.expose(&derived);

        let registry = Arc::downgrade(&self.registry);

        source.on_settled(move |input| {
            let continuation = match (input.is_ok(), &on_rejected) {
                (true, _)                  => &on_fulfilled,
                (false, Some(on_rejected)) => on_rejected,
                (false, None)              => return forward(&derived, input),
            };

            match defer::catch(move || Ok(continuation.invoke(input))) {
                Ok(Ok(result)) => result.forward(&derived),
                Ok(Err(e))     => record(&registry, target, e),
                Err(failure)   => forward(&derived, Err(failure)),
            }
        });

        debug!(source = %handle, derived = %target, "attached");

        Ok(target)
    }

    pub fn deferred(&self, handle: Handle) -> Option<Deferred<Value>> {
        self.lock().entries.get(&handle).cloned()
    }

    /// Transport failure recorded for `handle`, if any.
    pub fn fault(&self, handle: Handle) -> Option<Error> {
        self.lock().faults.get(&handle).cloned().map(Error::Transport)
    }

    /// Forget `handle`. Continuations already attached are unaffected.
    pub fn release(&self, handle: Handle) -> Option<Deferred<Value>> {
        let mut registry = self.lock();
        let deferred = registry.entries.remove(&handle)?;
        registry.exposed.remove(&deferred.id());
        registry.faults.remove(&handle);
        Some(deferred)
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn forward(derived: &Deferred<Value>, result: Result<Value, Failure>) {
    if derived.settle(result).is_err() {
        debug!(id = derived.id(), "derived already settled");
    }
}

fn record(registry: &Weak<Mutex<Registry>>, handle: Handle, e: anyhow::Error) {
    error!(%handle, "continuation not delivered: {e:#}");
    if let Some(registry) = registry.upgrade() {
        let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.faults.insert(handle, format!("{e:#}"));
    }
}

impl Handle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Continuation for Function {
    fn invoke(&self, input: Result<Value, Failure>) -> Result<Deferred<Value>> {
        let arg = match input {
            Ok(value)    => Arg::Value(value),
            Err(failure) => Arg::Failure(failure),
        };
        self.call(arg)
    }
}

impl<F> Continuation for Native<F>
where
    F: Fn(Result<Value, Failure>) -> Result<Value, Failure> + Send + Sync + 'static,
{
    fn invoke(&self, input: Result<Value, Failure>) -> Result<Deferred<Value>> {
        Ok(Deferred::settled((self.0)(input)))
    }
}
