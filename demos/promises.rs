use std::time::Duration;
use anyhow::Result;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use v8::{new_default_platform, V8};
use v8bridge::{Bridge, Deferred, Machine, ex::Timeout};
use v8bridge::defer::Failure;
use v8bridge::timer::Clock;

const MODULE: &str = r#"
export function asyncFoo() {
    const promise = new Promise((resolve, reject) => {
        console.log("Created Promise");
        setTimeout(() => {
            console.log("Resolving promise");
            resolve("Promise resolved in 150 ms");
        }, 150);
    });
    return promise;
}

export function receiveFoo(promise) {
    return promise.then((value) => {
        console.log("Received value from Future on JS side: " + value);
        return value;
    });
}

export function repeat(value) {
    return value.repeat(3);
}

export function rethrow(error) {
    throw error.repeat(3);
}
"#;

fn main() -> Result<()> {
    let mut filter = EnvFilter::from_default_env();
    filter = filter.add_directive(LevelFilter::INFO.into());
    let print = fmt::layer().compact();
    registry().with(filter).with(print).init();

    let platform = new_default_platform(0, false).make_shared();
    V8::initialize_platform(platform);
    V8::initialize();

    let (clock, _clock) = Clock::spawn();

    let mut machine = Machine::new(MODULE.to_owned());
    machine.extend(Timeout::new(clock.clone()));

    let (handle, _guard) = machine.exec();

    // A promise created on the JS side, received as a Deferred.
    let created = handle.find("asyncFoo")?.call(())?;
    info!("asyncFoo() -> {}", created.receiver().recv()?);

    // A Deferred created on the host side, observed from JS.
    let deferred = Deferred::new();
    deferred.schedule(&clock, Duration::from_millis(150), || Value::from("Future resolved in 150 ms"));
    let received = handle.find("receiveFoo")?.call(deferred)?;
    info!("receiveFoo(..) -> {}", received.receiver().recv()?);

    // The same exchange through handles, with JS continuations.
    let bridge  = Bridge::new();
    let repeat  = handle.find("repeat")?;
    let rethrow = handle.find("rethrow")?;

    let ok  = bridge.expose(&Deferred::settled(Ok(Value::from("abc"))));
    let err = bridge.expose(&Deferred::settled(Err(Failure::thrown(Value::from("abc")))));

    for source in [ok, err] {
        let derived = bridge.attach(source, Box::new(repeat.clone()), Some(Box::new(rethrow.clone())))?;
        if let Some(deferred) = bridge.deferred(derived) {
            info!("{source} -> {derived}: {:?}", deferred.receiver().recv());
        }
    }

    Ok(())
}
