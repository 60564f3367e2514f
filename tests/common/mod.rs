use std::sync::Once;
use std::time::Duration;
use serde_json::Value;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use v8::{new_default_platform, V8};
use v8bridge::Deferred;
use v8bridge::defer::Failure;
use v8bridge::timer::Timer;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env();
        filter = filter.add_directive(LevelFilter::WARN.into());
        let print = fmt::layer().compact();
        registry().with(filter).with(print).init();

        let platform = new_default_platform(0, false).make_shared();
        V8::initialize_platform(platform);
        V8::initialize();
    });
}

pub fn fulfill_after<T: Timer>(timer: &T, delay: u64, value: Value) -> Deferred<Value> {
    let deferred = Deferred::new();
    deferred.schedule(timer, Duration::from_millis(delay), move || value);
    deferred
}

pub fn reject_after<T: Timer>(timer: &T, delay: u64, failure: Failure) -> Deferred<Value> {
    let deferred = Deferred::new();
    let settler  = deferred.clone();
    timer.after(Duration::from_millis(delay), Box::new(move || {
        let _ = settler.reject(failure);
    }));
    deferred
}
