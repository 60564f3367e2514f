use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{spawn, JoinHandle};
use std::time::{Duration, Instant};
use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error};

pub type Task = Box<dyn FnOnce() + Send>;

/// Runs a task once, no earlier than `delay` after it was scheduled.
///
/// Tasks with equal deadlines run in scheduling order; nothing else is
/// promised about ordering.
pub trait Timer: Send + Sync + 'static {
    fn after(&self, delay: Duration, task: Task);
}

/// Timer service backed by a single thread.
#[derive(Clone)]
pub struct Clock {
    sender: Sender<Command>,
}

/// Stops the clock thread when dropped. Tasks that have not fired yet are
/// dropped with it.
pub struct Guard {
    clock:  Clock,
    thread: Option<JoinHandle<()>>,
}

enum Command {
    Schedule(Instant, Task),
    Park(Task),
    Stop,
}

struct Entry {
    at:   Instant,
    seq:  u64,
    task: Task,
}

impl Clock {
    pub fn spawn() -> (Clock, Guard) {
        let (sender, receiver) = unbounded();

        let clock  = Clock { sender };
        let thread = spawn(move || {
            run(receiver);
            debug!("clock finished");
        });

        let guard = Guard {
            clock:  clock.clone(),
            thread: Some(thread),
        };

        (clock, guard)
    }

    /// A delay too large to express as an `Instant` never fires; the task
    /// is held until the clock stops.
    pub fn schedule(&self, delay: Duration, task: Task) -> Result<()> {
        match Instant::now().checked_add(delay) {
            Some(at) => self.send(Command::Schedule(at, task)),
            None     => self.send(Command::Park(task)),
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        match self.sender.send(cmd) {
            Ok(()) => Ok(()),
            Err(_) => Err(anyhow!("clock stopped")),
        }
    }
}

impl Timer for Clock {
    fn after(&self, delay: Duration, task: Task) {
        if let Err(e) = self.schedule(delay, task) {
            error!("timer task dropped: {e}");
        }
    }
}

#[cfg(feature = "tokio")]
impl Timer for tokio::runtime::Handle {
    fn after(&self, delay: Duration, task: Task) {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

fn run(receiver: Receiver<Command>) {
    let mut queue  = BinaryHeap::new();
    let mut parked = Vec::new();
    let mut seq    = 0u64;

    loop {
        let next = queue.peek().map(|entry: &Reverse<Entry>| entry.0.at);

        let cmd = match next {
            Some(at) if at <= Instant::now() => {
                if let Some(Reverse(entry)) = queue.pop() {
                    fire(entry.task);
                }
                continue;
            }
            Some(at) => match receiver.recv_deadline(at) {
                Ok(cmd)                             => cmd,
                Err(RecvTimeoutError::Timeout)      => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match receiver.recv() {
                Ok(cmd) => cmd,
                Err(_)  => break,
            },
        };

        match cmd {
            Command::Schedule(at, task) => {
                queue.push(Reverse(Entry { at, seq, task }));
                seq += 1;
            }
            Command::Park(task) => parked.push(task),
            Command::Stop       => break,
        }
    }

    if !queue.is_empty() || !parked.is_empty() {
        let pending = queue.len() + parked.len();
        debug!(pending, "clock stopped with pending tasks");
    }
}

fn fire(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("timer task panicked");
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = self.clock.send(Command::Stop);
            match handle.join() {
                Ok(()) => (),
                Err(e) => error!("join error: {e:?}"),
            }
        }
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

#[cfg(test)]
mod test {
    use std::sync::mpsc;
    use crate::defer::{Deferred, State};
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let (clock, _guard) = Clock::spawn();
        let (tx, rx) = mpsc::channel();

        for (name, delay) in [("slow", 60), ("fast", 10), ("mid", 30)] {
            let tx = tx.clone();
            clock.after(Duration::from_millis(delay), Box::new(move || {
                let _ = tx.send(name);
            }));
        }

        let order = (0..3).map(|_| rx.recv().unwrap()).collect::<Vec<_>>();
        assert_eq!(order, ["fast", "mid", "slow"]);
    }

    #[test]
    fn equal_deadlines_keep_scheduling_order() {
        let (clock, _guard) = Clock::spawn();
        let (tx, rx) = mpsc::channel();

        for n in 0..10 {
            let tx = tx.clone();
            clock.after(Duration::ZERO, Box::new(move || {
                let _ = tx.send(n);
            }));
        }

        let order = (0..10).map(|_| rx.recv().unwrap()).collect::<Vec<_>>();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn never_fires_early() {
        let (clock, _guard) = Clock::spawn();
        let (tx, rx) = mpsc::channel();

        let start = Instant::now();
        clock.after(Duration::from_millis(150), Box::new(move || {
            let _ = tx.send(Instant::now());
        }));

        let fired = rx.recv().unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(150));
    }

    #[test]
    fn unbounded_delay_never_fires() {
        let (clock, _guard) = Clock::spawn();
        let (tx, rx) = mpsc::channel();

        let never = tx.clone();
        clock.after(Duration::MAX, Box::new(move || {
            let _ = never.send("never");
        }));
        clock.after(Duration::from_millis(5), Box::new(move || {
            let _ = tx.send("soon");
        }));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("soon"));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn unbounded_schedule_stays_pending() {
        let (clock, _guard) = Clock::spawn();
        let deferred = Deferred::new();

        deferred.schedule(&clock, Duration::MAX, || 1u8);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(deferred.state(), State::Pending);
    }

    #[test]
    fn survives_panicking_task() {
        let (clock, _guard) = Clock::spawn();
        let (tx, rx) = mpsc::channel();

        clock.after(Duration::ZERO, Box::new(|| panic!("task failed")));
        clock.after(Duration::from_millis(5), Box::new(move || {
            let _ = tx.send(());
        }));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(()));
    }

    #[test]
    fn stopped_clock_rejects_tasks() {
        let (clock, guard) = Clock::spawn();
        drop(guard);
        assert!(clock.schedule(Duration::ZERO, Box::new(|| ())).is_err());
    }
}
