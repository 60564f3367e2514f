use std::sync::Arc;
use std::thread::{spawn, JoinHandle};
use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Sender, Receiver};
use v8::{self, inspector::StringView};
use serde_json::Value;
use tracing::{debug, error};
use crate::defer::{Deferred, Failure};
use super::adjunct::Adjunct;
use super::context::{Context, Call, Export, Find};
use super::inspect::Inspector;
use super::promise::{Promises, Settled};

/// A JavaScript module waiting to be run on its own isolate thread.
pub struct Machine {
    module: String,
    extra:  Vec<Box<dyn Adjunct>>,
}

/// Cloneable command channel into a running machine.
#[derive(Clone)]
pub struct Handle {
    sender: Sender<Command>,
}

/// Stops and joins the machine thread on drop.
pub struct Guard {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

/// An exported module function.
#[derive(Clone)]
pub struct Function {
    export: Export,
    handle: Handle,
}

/// A single argument for a module function.
///
/// A `Deferred` arrives in JavaScript as a native promise that settles
/// when the host settles it; a `Failure` arrives as the value it would
/// reject a promise with.
pub enum Arg {
    Value(Value),
    Deferred(Deferred<Value>),
    Failure(Failure),
}

pub trait Args {
    fn args(self) -> Vec<Arg>;
}

struct Thread {
    module:   String,
    extra:    Vec<Box<dyn Adjunct>>,
    receiver: Receiver<Command>,
    handle:   Handle,
}

pub enum Command {
    Call(Call),
    Find(Find),
    Done(Settled),
    Stop,
}

impl Machine {
    pub fn new(module: String) -> Self {
        let extra = Vec::new();
        Self { module, extra }
    }

    pub fn extend<T: Adjunct>(&mut self, adjunct: Box<T>) {
        self.extra.push(adjunct);
    }

    pub fn exec(self) -> (Handle, Guard) {
        let (sender, receiver) = unbounded();

        let handle = Handle { sender };
        let thread = Thread {
            module:   self.module,
            extra:    self.extra,
            receiver: receiver,
            handle:   handle.clone(),
        };

        let thread = spawn(move || {
            match thread.exec() {
                Ok(()) => debug!("machine finished"),
                Err(e) => error!("machine failed: {e:?}"),
            }
        });

        let guard  = Guard {
            handle: handle.clone(),
            thread: Some(thread),
        };

        (handle, guard)
    }
}

impl Handle {
    /// Look up an export. Blocks until the machine answers, so it must not
    /// be called from a continuation running on the machine thread.
    pub fn find(&self, export: &str) -> Result<Function> {
        let (sender, receiver) = unbounded();
        let export = Arc::new(export.to_owned());
        let handle = self.clone();

        self.send(Command::Find(Find {
            export: export.clone(),
            sender: sender,
        }))?;

        let export = receiver.recv()??;
        Ok(Function { export, handle })
    }

    pub fn done(&self, settled: Settled) -> Result<()> {
        self.send(Command::Done(settled))
    }

    fn send(&self, cmd: Command) -> Result<()> {
        match self.sender.send(cmd) {
            Ok(()) => Ok(()),
            Err(_) => Err(anyhow!("machine terminated")),
        }
    }
}

impl Function {
    /// Call the export. The returned `Deferred` settles with its return
    /// value, its thrown exception, or the outcome of the promise it
    /// returns. Fails only when the machine is gone.
    pub fn call<A: Args>(&self, args: A) -> Result<Deferred<Value>> {
        let deferred = Deferred::new();
        let export   = self.export.clone();
        self.handle.send(Command::Call(Call {
            export:   export,
            args:     args.args(),
            deferred: deferred.clone(),
        }))?;
        Ok(deferred)
    }
}

impl Thread {
    fn exec(self) -> Result<()> {
        let Self { module, extra, receiver, handle } = self;

        let mut promises  = Promises::new(handle);

        let mut isolate   = v8::Isolate::new(v8::CreateParams::default());
        let mut inspector = Inspector::new();
        let mut inspector = inspector.create(&mut isolate);

        let scope  = &mut v8::HandleScope::new(&mut isolate);
        let global = v8::ObjectTemplate::new(scope);
        global.set_internal_field_count(1);

        for adjunct in &extra {
            adjunct.install(scope, &global);
        }

        let context   = v8::Context::new_from_template(scope, global);
        let mut scope = v8::ContextScope::new(scope, context);

        let promises = &mut promises as *mut Promises;
        let promises = v8::External::new(&mut scope, promises as _);

        let global = context.global(&mut scope);
        global.set_internal_field(0, promises.into());

        let name = StringView::from(b"".as_slice());
        inspector.context_created(context, 1, name);

        let mut context = Context::new(scope, &module)?;

        loop {
            match receiver.recv() {
                Ok(Command::Call(call))    => context.call(call)?,
                Ok(Command::Find(find))    => context.find(find)?,
                Ok(Command::Done(settled)) => context.done(settled)?,
                Ok(Command::Stop) | Err(_) => break,
            }
            context.tick();
        }

        Ok(())
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = self.handle.send(Command::Stop);
            match handle.join() {
                Ok(()) => (),
                Err(e) => error!("join error: {e:?}"),
            }
        }
    }
}

impl Args for () {
    fn args(self) -> Vec<Arg> {
        Vec::new()
    }
}

impl Args for Value {
    fn args(self) -> Vec<Arg> {
        vec![Arg::Value(self)]
    }
}

impl Args for Vec<Value> {
    fn args(self) -> Vec<Arg> {
        self.into_iter().map(Arg::Value).collect()
    }
}

impl Args for Deferred<Value> {
    fn args(self) -> Vec<Arg> {
        vec![Arg::Deferred(self)]
    }
}

impl Args for Failure {
    fn args(self) -> Vec<Arg> {
        vec![Arg::Failure(self)]
    }
}

impl Args for Arg {
    fn args(self) -> Vec<Arg> {
        vec![self]
    }
}

impl Args for Vec<Arg> {
    fn args(self) -> Vec<Arg> {
        self
    }
}
