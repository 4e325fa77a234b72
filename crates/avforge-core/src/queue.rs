//! A bounded queue with an explicit, externally-triggerable close signal
//! (spec §9 Design Notes: "use a bounded async queue for backpressure").
//!
//! Dropping every sender/receiver handle (as a plain `crossbeam_channel`
//! would require) isn't enough here: the pipeline scheduler's `stop()` needs
//! to unblock a stage that is parked in a blocking `send` or `recv` *without*
//! every clone of the queue going out of scope at once. `AsyncQueue` solves
//! this with a second, data-free "closer" channel that `select!` races
//! against the data channel.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

/// A cheap-to-clone handle to a bounded, close-aware queue.
///
/// All clones share the same underlying channels and close state; closing
/// any clone closes the queue for all of them.
pub struct AsyncQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    data_tx: Sender<T>,
    data_rx: Receiver<T>,
    closer_tx: Mutex<Option<Sender<Infallible>>>,
    closer_rx: Receiver<Infallible>,
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        AsyncQueue { inner: self.inner.clone() }
    }
}

/// Returned by [`AsyncQueue::send`] when the queue was closed before (or
/// while) the value could be delivered. The value is returned so the caller
/// can decide whether to drop it or route it elsewhere.
#[derive(Debug)]
pub struct Closed<T>(pub T);

impl<T> AsyncQueue<T> {
    /// Creates a new queue holding at most `capacity` items in flight.
    pub fn new(capacity: usize) -> Self {
        let (data_tx, data_rx) = bounded(capacity);
        let (closer_tx, closer_rx) = bounded(0);
        Inner {
            data_tx,
            data_rx,
            closer_tx: Mutex::new(Some(closer_tx)),
            closer_rx,
        }
        .into()
    }

    /// Blocks until there is capacity to deliver `value`, or the queue is
    /// closed — whichever happens first.
    pub fn send(&self, value: T) -> Result<(), Closed<T>> {
        if self.is_closed() {
            return Err(Closed(value));
        }
        crossbeam_channel::select! {
            send(self.inner.data_tx, value) -> res => match res {
                Ok(()) => Ok(()),
                // data_rx was dropped without going through close(); treat
                // the same as closed rather than panicking.
                Err(crossbeam_channel::SendError(v)) => Err(Closed(v)),
            },
            recv(self.inner.closer_rx) -> res => match res {
                Ok(_) => unreachable!("closer channel never carries a value"),
                Err(_) => Err(Closed(value)),
            },
        }
    }

    /// Blocks until an item is available or the queue is closed and drained.
    /// Buffered items sent before `close()` are still delivered; `None` is
    /// only returned once the data channel is both closed and empty.
    pub fn recv(&self) -> Option<T> {
        loop {
            crossbeam_channel::select! {
                recv(self.inner.data_rx) -> res => {
                    return res.ok();
                }
                recv(self.inner.closer_rx) -> res => {
                    match res {
                        Ok(_) => unreachable!("closer channel never carries a value"),
                        Err(_) => {
                            // Closed: drain whatever is already buffered
                            // before reporting end-of-queue.
                            match self.inner.data_rx.try_recv() {
                                Ok(v) => return Some(v),
                                Err(_) => return None,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Signals close: every blocked or future `send`/`recv` on any clone of
    /// this queue unblocks. Idempotent.
    pub fn close(&self) {
        self.inner.closer_tx.lock().expect("closer mutex poisoned").take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closer_tx.lock().expect("closer mutex poisoned").is_none()
    }

    pub fn len(&self) -> usize {
        self.inner.data_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data_rx.is_empty()
    }
}

impl<T> From<Inner<T>> for AsyncQueue<T> {
    fn from(inner: Inner<T>) -> Self {
        AsyncQueue { inner: Arc::new(inner) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn send_then_recv_roundtrips() {
        let q = AsyncQueue::new(4);
        q.send(1).unwrap();
        q.send(2).unwrap();
        assert_eq!(q.recv(), Some(1));
        assert_eq!(q.recv(), Some(2));
    }

    #[test]
    fn close_unblocks_a_parked_receiver() {
        let q: AsyncQueue<i32> = AsyncQueue::new(1);
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.recv());
        std::thread::sleep(Duration::from_millis(50));
        q.close();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn buffered_items_survive_close() {
        let q = AsyncQueue::new(4);
        q.send(1).unwrap();
        q.send(2).unwrap();
        q.close();
        assert_eq!(q.recv(), Some(1));
        assert_eq!(q.recv(), Some(2));
        assert_eq!(q.recv(), None);
    }

    #[test]
    fn send_after_close_fails() {
        let q = AsyncQueue::new(4);
        q.close();
        match q.send(42) {
            Err(Closed(v)) => assert_eq!(v, 42),
            Ok(()) => panic!("send should fail once queue is closed"),
        }
    }

    #[test]
    fn close_unblocks_a_parked_sender_on_a_full_queue() {
        let q: AsyncQueue<i32> = AsyncQueue::new(1);
        q.send(1).unwrap();
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.send(2));
        std::thread::sleep(Duration::from_millis(50));
        q.close();
        assert!(matches!(handle.join().unwrap(), Err(Closed(2))));
    }

    #[test]
    fn is_closed_reflects_state() {
        let q: AsyncQueue<i32> = AsyncQueue::new(1);
        assert!(!q.is_closed());
        q.close();
        assert!(q.is_closed());
        q.close(); // idempotent
        assert!(q.is_closed());
    }
}
