#[cfg(not(feature = "tokio"))]
use crossbeam_channel::{bounded, Sender, Receiver};
#[cfg(feature = "tokio")]
use std::{future::Future, pin::Pin, task::{Context, Poll}};
#[cfg(feature = "tokio")]
use tokio::sync::oneshot::{channel, Sender, Receiver};
use crate::error::Error;
use super::failure::Failure;

pub struct Tx<T>(Sender<Result<T, Failure>>);

/// Receiving end of [`Deferred::receiver`](super::Deferred::receiver).
///
/// Resolves to [`Error::Rejected`] on rejection and to [`Error::Abandoned`]
/// when the `Deferred` is dropped without settling. Bounding the wait is
/// left to the caller.
pub struct Rx<T>(Receiver<Result<T, Failure>>);

pub fn oneshot<T>() -> (Tx<T>, Rx<T>) {
    let (tx, rx) = channel();
    (Tx(tx), Rx(rx))
}

#[cfg(not(feature = "tokio"))]
fn channel<T>() -> (Sender<T>, Receiver<T>) {
    bounded(1)
}

impl<T> Tx<T> {
    pub fn send(self, result: Result<T, Failure>) {
        match self.0.send(result) {
            Ok(()) => (),
            Err(_) => (),
        }
    }
}

#[cfg(not(feature = "tokio"))]
impl<T> Rx<T> {
    pub fn recv(self) -> Result<T, Error> {
        match self.0.recv() {
            Ok(r)  => r.map_err(Error::Rejected),
            Err(_) => Err(Error::Abandoned),
        }
    }
}

#[cfg(feature = "tokio")]
impl<T> Rx<T> {
    /// Block until settled. Must not be called from within an async context.
    pub fn recv(self) -> Result<T, Error> {
        match self.0.blocking_recv() {
            Ok(r)  => r.map_err(Error::Rejected),
            Err(_) => Err(Error::Abandoned),
        }
    }
}

#[cfg(feature = "tokio")]
impl<T> Future for Rx<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(r))  => Poll::Ready(r.map_err(Error::Rejected)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Abandoned)),
            Poll::Pending       => Poll::Pending,
        }
    }
}
