use std::collections::HashMap;
use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::{debug, error};
use v8::{self, Global, HandleScope, Local, PromiseResolver};
use crate::defer::{Failure, Kind};
use super::machine::Handle;

/// Table of JavaScript promises whose settlement is driven by the host.
///
/// Lives on the machine thread and is reachable from script callbacks
/// through internal field 0 of the global object.
pub struct Promises {
    counter: u64,
    handle:  Handle,
    pending: HashMap<u64, Global<PromiseResolver>>,
}

pub enum Settled {
    Fulfilled(u64, Box<dyn Resolved>),
    Rejected(u64, Box<dyn Resolved>),
}

/// Write side of a promise in [`Promises`]; may be moved to any thread.
pub struct Resolver {
    id: u64,
    tx: Handle,
}

pub trait Resolved: Send + 'static {
    fn value<'s>(self: Box<Self>, scope: &mut HandleScope<'s>) -> Result<Local<'s, v8::Value>>;
}

impl Promises {
    pub fn new(handle: Handle) -> Self {
        Self {
            counter: 0,
            handle:  handle,
            pending: HashMap::new(),
        }
    }

    pub fn insert(local: Local<v8::Value>, resolver: Global<PromiseResolver>) -> Result<Resolver> {
        let promises = Self::get(local)?;

        let id = promises.counter;
        let tx = promises.handle.clone();

        promises.counter += 1;
        promises.pending.insert(id, resolver);

        Ok(Resolver { id, tx })
    }

    pub fn settle(local: Local<v8::Value>, scope: &mut HandleScope, settled: Settled) -> Result<()> {
        enum Outcome<'s> {
            Fulfilled(Local<'s, v8::Value>),
            Rejected(Local<'s, v8::Value>),
        }

        let (id, outcome) = match settled {
            Settled::Fulfilled(id, v) => (id, Outcome::Fulfilled(v.value(scope)?)),
            Settled::Rejected(id, v)  => (id, Outcome::Rejected(v.value(scope)?)),
        };

        match Self::get(local)?.pending.remove(&id) {
            Some(resolver) => {
                let resolver = Local::new(scope, resolver);
                match outcome {
                    Outcome::Fulfilled(v) => resolver.resolve(scope, v),
                    Outcome::Rejected(v)  => resolver.reject(scope, v),
                };
            }
            None => debug!(id, "promise already settled"),
        }

        Ok(())
    }

    fn get(local: Local<v8::Value>) -> Result<&mut Promises> {
        let promises = Local::<v8::External>::try_from(local)?;
        let promises = promises.value() as *mut Self;
        Ok(unsafe { &mut *promises })
    }
}

impl Resolver {
    pub fn resolve(self, value: Box<dyn Resolved>) -> Result<()> {
        match self.tx.done(Settled::Fulfilled(self.id, value)) {
            Ok(()) => Ok(()),
            Err(_) => Err(anyhow!("channel closed")),
        }
    }

    pub fn reject(self, value: Box<dyn Resolved>) -> Result<()> {
        match self.tx.done(Settled::Rejected(self.id, value)) {
            Ok(()) => Ok(()),
            Err(_) => Err(anyhow!("channel closed")),
        }
    }

    /// Settle with a host outcome; a machine that has already stopped
    /// leaves the promise pending.
    pub fn settle(self, result: Result<Value, Failure>) {
        let id = self.id;

        let sent = match result {
            Ok(value)    => self.resolve(Box::new(value)),
            Err(failure) => self.reject(Box::new(failure)),
        };

        if let Err(e) = sent {
            error!(id, "promise not settled: {e}");
        }
    }
}

impl Resolved for Failure {
    fn value<'s>(self: Box<Self>, scope: &mut HandleScope<'s>) -> Result<Local<'s, v8::Value>> {
        if self.kind() == Kind::Thrown {
            return Ok(serde_v8::to_v8(scope, Failure::value(&self))?);
        }

        let context = scope.get_current_context();
        let global  = context.global(scope);

        let message = v8::String::new(scope, self.message()).unwrap();

        let name  = v8::String::new(scope, "Error").unwrap();
        let ctor  = global.get(scope, name.into()).unwrap();
        let ctor  = v8::Local::<v8::Function>::try_from(ctor)?;
        let args  = &[message.into()];

        Ok(ctor.new_instance(scope, args).unwrap().into())
    }
}

impl Resolved for Value {
    fn value<'s>(self: Box<Self>, scope: &mut HandleScope<'s>) -> Result<Local<'s, v8::Value>> {
        Ok(serde_v8::to_v8(scope, *self)?)
    }
}
