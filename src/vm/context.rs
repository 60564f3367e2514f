use std::fmt::Write;
use std::sync::Arc;
use anyhow::{anyhow, Error, Result};
use crossbeam_channel::Sender;
use serde_json::Value;
use tracing::{debug, error};
use v8::{self, ContextScope, Function, HandleScope, Local, Weak};
use v8::script_compiler::{compile_module, Source};
use crate::defer::{Deferred, Failure, Kind};
use super::machine::Arg;
use super::promise::{Promises, Resolved, Settled};

pub struct Context<'i, 's> {
    pub context: Local<'s, v8::Context>,
    pub scope:   ContextScope<'i, HandleScope<'s>>,
    pub exports: Local<'s, v8::Object>,
}

pub struct Call {
    pub export:   Export,
    pub args:     Vec<Arg>,
    pub deferred: Deferred<Value>,
}

pub struct Find {
    pub export: Arc<String>,
    pub sender: Sender<Result<Export>>,
}

#[derive(Clone)]
pub struct Export {
    weak: Arc<Weak<Function>>,
}

unsafe impl Send for Export {}
unsafe impl Sync for Export {}

impl<'i, 's> Context<'i, 's> {
    pub fn new(mut scope: ContextScope<'i, HandleScope<'s>>, module: &str) -> Result<Self> {
        let context = scope.get_current_context();

        let exports = {
            let scope = &mut v8::TryCatch::new(&mut scope);

            let module = match compile(scope, module) {
                Some(module) => module,
                None         => return Err(exception(scope)),
            };

            let object = module.get_module_namespace();
            object.to_object(scope).unwrap()
        };

        Ok(Self {
            context: context,
            scope:   scope,
            exports: exports,
        })
    }

    pub fn call(&mut self, Call { export, args, deferred }: Call) -> Result<()> {
        let scope = &mut v8::HandleScope::new(&mut self.scope);
        let scope = &mut v8::TryCatch::new(scope);

        let func = match export.weak.to_local(scope) {
            Some(func) => func,
            None       => {
                settle(&deferred, Err(Failure::error("export gone")));
                return Ok(());
            }
        };

        let global   = self.context.global(scope);
        let promises = global.get_internal_field(scope, 0).unwrap();

        let args = args.into_iter().map(|arg| {
            argument(scope, promises, arg)
        }).collect::<Result<Vec<_>>>();

        let args = match args {
            Ok(args) => args,
            Err(e)   => {
                settle(&deferred, Err(e.into()));
                return Ok(());
            }
        };

        let result = match func.call(scope, global.into(), &args) {
            Some(result) => result,
            None         => v8::undefined(scope).into(),
        };

        if !result.is_promise() {
            let outcome = match scope.exception() {
                None    => value(scope, result),
                Some(e) => Err(failure(scope, e)),
            };
            settle(&deferred, outcome);
            return Ok(());
        }

        let data = Box::into_raw(Box::new(deferred));
        let data = v8::External::new(scope, data as _).into();

        let resolved = v8::Function::builder(resolved).data(data).build(scope).unwrap();
        let rejected = v8::Function::builder(rejected).data(data).build(scope).unwrap();

        let promise = v8::Local::<v8::Promise>::try_from(result)?;
        promise.then2(scope, resolved, rejected).unwrap();

        Ok(())
    }

    pub fn find(&mut self, Find { export, sender }: Find) -> Result<()> {
        let scope = &mut v8::HandleScope::new(&mut self.scope);

        let name = v8::String::new(scope, &export).unwrap();
        let func = match self.exports.get(scope, name.into()) {
            Some(func) => func,
            None       => v8::undefined(scope).into(),
        };

        let result = match v8::Local::<v8::Function>::try_from(func) {
            Ok(f)  => Ok(Export::new(Weak::new(scope, f))),
            Err(_) => Err(anyhow!("{export} is not a function")),
        };

        sender.send(result).or(Ok(()))
    }

    pub fn done(&mut self, settled: Settled) -> Result<()> {
        let scope  = &mut v8::HandleScope::new(&mut self.scope);
        let global = self.context.global(scope);

        let promises = global.get_internal_field(scope, 0).unwrap();
        if let Err(e) = Promises::settle(promises, scope, settled) {
            error!("promise settlement failed: {e:?}");
        }

        Ok(())
    }

    pub fn tick(&mut self) {
        let platform = &v8::V8::get_current_platform();
        let scope    = &mut self.scope;
        v8::Platform::pump_message_loop(platform, scope, false);
        scope.perform_microtask_checkpoint();
    }
}

impl Export {
    fn new(weak: Weak<Function>) -> Self {
        Self { weak: Arc::new(weak) }
    }
}

fn argument<'s>(
    scope:    &mut HandleScope<'s>,
    promises: Local<v8::Value>,
    arg:      Arg,
) -> Result<Local<'s, v8::Value>> {
    match arg {
        Arg::Value(value)       => Ok(serde_v8::to_v8(scope, value)?),
        Arg::Failure(failure)   => Box::new(failure).value(scope),
        Arg::Deferred(deferred) => {
            let resolver = v8::PromiseResolver::new(scope).unwrap();
            let promise  = resolver.get_promise(scope);

            let resolver = v8::Global::new(scope, resolver);
            let resolver = Promises::insert(promises, resolver)?;

            debug!(deferred = deferred.id(), "deferred passed as promise");
            deferred.on_settled(move |result| resolver.settle(result));

            Ok(promise.into())
        }
    }
}

fn settle(deferred: &Deferred<Value>, outcome: Result<Value, Failure>) {
    if deferred.settle(outcome).is_err() {
        debug!(id = deferred.id(), "call result discarded");
    }
}

fn take(args: &v8::FunctionCallbackArguments) -> Box<Deferred<Value>> {
    let data = args.data().unwrap();
    let data = v8::Local::<v8::External>::try_from(data).unwrap();
    unsafe { Box::from_raw(data.value() as *mut Deferred<Value>) }
}

fn resolved(
  scope:   &mut v8::HandleScope,
  args:    v8::FunctionCallbackArguments,
  _result: v8::ReturnValue,
) {
    let scope    = &mut v8::HandleScope::new(scope);
    let deferred = take(&args);
    let outcome  = value(scope, args.get(0));
    settle(&deferred, outcome);
}

fn rejected(
  scope:   &mut v8::HandleScope,
  args:    v8::FunctionCallbackArguments,
  _result: v8::ReturnValue,
) {
    let scope    = &mut v8::HandleScope::new(scope);
    let deferred = take(&args);
    let outcome  = Err(failure(scope, args.get(0)));
    settle(&deferred, outcome);
}

fn value<'a>(scope: &mut HandleScope<'a>, value: Local<'a, v8::Value>) -> Result<Value, Failure> {
    match serde_v8::from_v8(scope, value) {
        Ok(value) => Ok(value),
        Err(e)    => Err(Failure::error(format!("unrepresentable value: {e}"))),
    }
}

// Error instances keep their message and are rebuilt as `Error`s when
// they cross back; anything else travels as the thrown value.
fn failure<'a>(scope: &mut HandleScope<'a>, value: Local<'a, v8::Value>) -> Failure {
    if value.is_native_error() {
        let text = value.to_rust_string_lossy(scope);

        let message = v8::Local::<v8::Object>::try_from(value).ok().and_then(|object| {
            let name = v8::String::new(scope, "message")?;
            object.get(scope, name.into())
        }).map(|message| {
            message.to_rust_string_lossy(scope)
        }).unwrap_or_else(|| text.clone());

        return Failure::new(Kind::Error, message, Value::String(text));
    }

    match serde_v8::from_v8(scope, value) {
        Ok(value) => Failure::thrown(value),
        Err(_)    => Failure::thrown(Value::String(value.to_rust_string_lossy(scope))),
    }
}

fn compile<'i, 's>(
    scope: &mut v8::TryCatch<'i, v8::HandleScope<'s>>,
    code:  &str
) -> Option<v8::Local<'s, v8::Module>> {
    let code   = v8::String::new(scope, code)?;
    let name   = v8::String::new(scope, "<script>")?;
    let srcmap = v8::undefined(scope);
    let origin = v8::ScriptOrigin::new(
        scope,
        name.into(),
        0,
        0,
        false,
        0,
        srcmap.into(),
        false,
        false,
        true,
    );

    let source = Source::new(code, Some(&origin));

    let module = compile_module(scope, source)?;
    module.instantiate_module(scope, |_, _, _, _| None)?;
    module.evaluate(scope)?;

    Some(module)
}

pub fn exception(scope: &mut v8::TryCatch<v8::HandleScope>) -> Error {
    anyhow!(message(scope).or_else(|| {
        scope.exception().map(|s| s.to_rust_string_lossy(scope))
    }).unwrap_or_else(|| {
        "no exception or message".to_owned()
    }))
}

fn message(scope: &mut v8::TryCatch<v8::HandleScope>) -> Option<String> {
    let msg    = scope.message()?;
    let text   = msg.get(scope).to_rust_string_lossy(scope);
    let script = msg.get_script_resource_name(scope)?.to_rust_string_lossy(scope);
    let source = msg.get_source_line(scope)?.to_rust_string_lossy(scope);
    let line   = msg.get_line_number(scope)?;
    let column = msg.get_start_column();
    let length = msg.get_end_column().saturating_sub(column);

    let mut e = String::new();
    writeln!(&mut e, "{}", text).ok()?;
    writeln!(&mut e, "{:>4}--> {}:{}:{}", "", script, line, column).ok()?;
    writeln!(&mut e, "{:>4} |   ", "").ok()?;
    writeln!(&mut e, "{:>4} | {}", line, source).ok()?;
    writeln!(&mut e, "{:>4} | {:>3$}{:^>4$}", "", "", "", column, length).ok()?;

    Some(e)
}
