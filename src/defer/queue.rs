use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;
use super::failure::describe;

pub type Job = Box<dyn FnOnce() + Send>;

// Per-thread run queue. Whichever frame finds it idle drains it; nested
// submissions only append, so settlement from inside a continuation never
// recurses.
struct Queue {
    jobs:     VecDeque<Job>,
    draining: bool,
}

thread_local! {
    static QUEUE: RefCell<Queue> = RefCell::new(Queue {
        jobs:     VecDeque::new(),
        draining: false,
    });
}

pub fn submit(jobs: Vec<Job>) {
    if jobs.is_empty() {
        return;
    }

    let idle = QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        queue.jobs.extend(jobs);
        !mem::replace(&mut queue.draining, true)
    });

    if idle {
        drain();
    }
}

fn drain() {
    while let Some(job) = QUEUE.with(|queue| queue.borrow_mut().jobs.pop_front()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            error!("continuation panicked: {}", describe(panic.as_ref()));
        }
    }

    QUEUE.with(|queue| queue.borrow_mut().draining = false);
}
