use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use anyhow::Result;
use tracing::error;
use v8::{self, Global, HandleScope, Local, ObjectTemplate};
use crate::timer::Timer;
use crate::vm::{Adjunct, Promises, Resolved, Resolver};

/// Installs `setTimeout(callback, delay, ...args)` backed by a host
/// [`Timer`].
///
/// The callback runs on the machine thread as a promise reaction once the
/// timer fires, so it never runs before `delay` milliseconds have passed.
/// It receives exactly the extra arguments given to `setTimeout`.
///
/// The returned id is a positive integer unique to this machine. There is
/// no `clearTimeout`; a scheduled callback always runs.
pub struct Timeout<T> {
    timer:   T,
    counter: AtomicU32,
}

impl<T: Timer> Timeout<T> {
    pub fn new(timer: T) -> Box<Self> {
        Box::new(Self {
            timer:   timer,
            counter: AtomicU32::new(0),
        })
    }

    fn schedule(&self, delay: Duration, resolver: Resolver) -> u32 {
        self.timer.after(delay, Box::new(move || {
            if let Err(e) = resolver.resolve(Box::new(Undefined)) {
                error!("setTimeout: {e}");
            }
        }));
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

struct Undefined;

impl Resolved for Undefined {
    fn value<'s>(self: Box<Self>, scope: &mut HandleScope<'s>) -> Result<Local<'s, v8::Value>> {
        Ok(v8::undefined(scope).into())
    }
}

impl<T: Timer> Adjunct for Timeout<T> {
    fn install(&self, scope: &mut HandleScope<()>, global: &ObjectTemplate) {
        let data = self as *const Self;
        let data = v8::External::new(scope, data as _).into();

        let name  = v8::String::new(scope, "setTimeout").unwrap();
        let value = v8::FunctionTemplate::builder(set_timeout::<T>).data(data).build(scope);
        global.set(name.into(), value.into());
    }
}

fn set_timeout<T: Timer>(
  scope:      &mut v8::HandleScope,
  args:       v8::FunctionCallbackArguments,
  mut result: v8::ReturnValue,
) {
    let scope = &mut v8::HandleScope::new(scope);

    let callback = match Local::<v8::Function>::try_from(args.get(0)) {
        Ok(callback) => callback,
        Err(_)       => {
            let message = v8::String::new(scope, "setTimeout: callback is not a function").unwrap();
            let error   = v8::Exception::type_error(scope, message);
            scope.throw_exception(error);
            return;
        }
    };

    let delay = match args.get(1).number_value(scope) {
        Some(ms) if ms.is_finite() && ms > 0.0 => Duration::from_millis(ms as u64),
        _                                      => Duration::ZERO,
    };

    let context  = scope.get_current_context();
    let global   = context.global(scope);
    let promises = global.get_internal_field(scope, 0).unwrap();

    let bound = v8::Array::new(scope, args.length().max(2) - 1);
    bound.set_index(scope, 0, callback.into());
    for n in 2..args.length() {
        bound.set_index(scope, (n - 1) as u32, args.get(n));
    }
    let reaction = v8::Function::builder(fire).data(bound.into()).build(scope).unwrap();

    let resolver = v8::PromiseResolver::new(scope).unwrap();
    let promise  = resolver.get_promise(scope);
    promise.then(scope, reaction);

    let resolver = Global::new(scope, resolver);
    let resolver = match Promises::insert(promises, resolver) {
        Ok(resolver) => resolver,
        Err(e)       => {
            error!("setTimeout: {e:?}");
            return;
        }
    };

    let data    = args.data().unwrap();
    let data    = v8::Local::<v8::External>::try_from(data).unwrap();
    let timeout = data.value() as *const Timeout<T>;
    let timeout = unsafe { &*timeout };

    let id = timeout.schedule(delay, resolver);

    result.set(v8::Integer::new_from_unsigned(scope, id).into());
}

// Calls the user callback with the arguments captured by `setTimeout`,
// ignoring the settled value of the timer promise.
fn fire(
  scope:   &mut v8::HandleScope,
  args:    v8::FunctionCallbackArguments,
  _result: v8::ReturnValue,
) {
    let scope = &mut v8::HandleScope::new(scope);

    let bound = args.data().unwrap();
    let bound = v8::Local::<v8::Array>::try_from(bound).unwrap();

    let callback = bound.get_index(scope, 0).unwrap();
    let callback = v8::Local::<v8::Function>::try_from(callback).unwrap();

    let params = (1..bound.length()).filter_map(|n| {
        bound.get_index(scope, n)
    }).collect::<Vec<_>>();

    let receiver = v8::undefined(scope).into();
    callback.call(scope, receiver, &params);
}
