//! Typed rendezvous channels with optional buffering.
//!
//! A [`Channel<T>`] pairs senders and receivers directly whenever it can: a
//! value offered to a channel with a parked receiver is handed straight to
//! that receiver, bypassing the buffer, so parked receivers never coexist
//! with buffered values. With a capacity of zero the channel is a pure
//! rendezvous point; with a positive capacity it absorbs up to that many
//! values before senders park.
//!
//! Parked waiters are queued FIFO per channel and served in order. Closing
//! a channel wakes every parked waiter: parked receivers observe the
//! closed, drained state; parked senders fail with [`SendError`].
//!
//! # Overview
//!
//! - [`Channel::send`] / [`Channel::recv`] — blocking operations
//! - [`Channel::try_send`] / [`Channel::try_recv`] — non-blocking variants
//! - [`Channel::close`] — idempotent end-of-stream
//! - [`Channel::iter`] — drain values until closed
//!
//! Cloning a [`Channel`] clones the handle; all clones refer to the same
//! channel.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::context::{coordinator, Context, Direction, Offer};
use crate::error::{SendError, TryRecvError, TrySendError};

/// Result of an erased non-blocking receive attempt.
pub(crate) enum Peeked {
    /// A value was taken from the channel.
    Value(Box<dyn Any + Send>),
    /// Nothing available right now.
    Empty,
    /// The channel is closed and its buffer is drained.
    Drained,
}

/// Result of an erased non-blocking send attempt.
pub(crate) enum Poked {
    /// The value was delivered or buffered; the slot is now empty.
    Sent,
    /// No progress possible right now; the slot still holds the value.
    Busy,
    /// The channel is closed; the slot still holds the value.
    Closed,
}

/// Type-erased channel surface used by contexts and the selector, so one
/// selector can span channels of different element types.
pub(crate) trait Endpoint: Send + Sync {
    /// Stable identity of this channel.
    fn chan_id(&self) -> usize;
    /// Non-blocking erased receive.
    fn peek(&self) -> Peeked;
    /// Non-blocking erased send of the value held in `slot`.
    fn poke(&self, slot: &mut Option<Box<dyn Any + Send>>) -> Poked;
    /// Park `ctx` on the waiter queue for `dir`. Refuses (returns `false`)
    /// on a closed channel, where nothing would ever wake the waiter.
    /// Coordinator held by the caller.
    fn register(&self, dir: Direction, ctx: &Arc<Context>) -> bool;
    /// Remove `ctx` from the waiter queue for `dir`; reports whether it was
    /// present. Coordinator held by the caller.
    fn deregister(&self, dir: Direction, ctx: &Context) -> bool;
}

struct State<T> {
    buffer: Box<[Option<T>]>,
    /// Next slot to fill; `sendx = (recvx + count) mod capacity`.
    sendx: usize,
    /// Next slot to drain.
    recvx: usize,
    sendq: VecDeque<Arc<Context>>,
    recvq: VecDeque<Arc<Context>>,
}

struct Shared<T> {
    capacity: usize,
    closed: AtomicBool,
    /// Buffered value count, mirrored atomically for lock-free observers.
    count: AtomicUsize,
    /// Queue lengths mirrored atomically for the pre-lock fast-fail checks.
    send_waiters: AtomicUsize,
    recv_waiters: AtomicUsize,
    state: Mutex<State<T>>,
}

fn is_ctx(entry: &Arc<Context>, ctx: &Context) -> bool {
    std::ptr::eq(Arc::as_ptr(entry), ctx)
}

/// Downcast an erased value back to its element type. The type always
/// matches by construction; a mismatch is an implementation bug.
pub(crate) fn downcast_value<T: 'static>(boxed: Box<dyn Any + Send>) -> T {
    match boxed.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => panic!("erased value does not match the element type"),
    }
}

impl<T: Send + 'static> Shared<T> {
    fn id(&self) -> usize {
        self as *const Shared<T> as *const () as usize
    }

    fn push_waiter(&self, state: &mut State<T>, dir: Direction, ctx: Arc<Context>) {
        let (queue, mirror) = match dir {
            Direction::Send => (&mut state.sendq, &self.send_waiters),
            Direction::Recv => (&mut state.recvq, &self.recv_waiters),
        };
        queue.push_back(ctx);
        mirror.store(queue.len(), Ordering::SeqCst);
    }

    fn pop_waiter(&self, state: &mut State<T>, dir: Direction) -> Option<Arc<Context>> {
        let (queue, mirror) = match dir {
            Direction::Send => (&mut state.sendq, &self.send_waiters),
            Direction::Recv => (&mut state.recvq, &self.recv_waiters),
        };
        let ctx = queue.pop_front();
        mirror.store(queue.len(), Ordering::SeqCst);
        ctx
    }

    fn remove_waiter(&self, state: &mut State<T>, dir: Direction, ctx: &Context) -> bool {
        let (queue, mirror) = match dir {
            Direction::Send => (&mut state.sendq, &self.send_waiters),
            Direction::Recv => (&mut state.recvq, &self.recv_waiters),
        };
        let before = queue.len();
        queue.retain(|entry| !is_ctx(entry, ctx));
        mirror.store(queue.len(), Ordering::SeqCst);
        queue.len() != before
    }

    /// Drop every remaining queue entry for `ctx`. A context committed on
    /// this channel may still sit in the other queue, or again in the same
    /// queue, when a selector offered this channel more than once.
    fn purge_waiter(&self, state: &mut State<T>, ctx: &Context) {
        self.remove_waiter(state, Direction::Send, ctx);
        self.remove_waiter(state, Direction::Recv, ctx);
    }

    /// One attempt at sender progress under the coordinator and state lock:
    /// hand the value to a parked receiver or buffer it. `Err` returns the
    /// value when only parking would help.
    fn send_ready(&self, state: &mut State<T>, value: T) -> Result<(), T> {
        if let Some(receiver) = self.pop_waiter(state, Direction::Recv) {
            receiver.commit_receiver(self.id(), Box::new(value));
            self.purge_waiter(state, &receiver);
            receiver.signal();
            return Ok(());
        }
        if self.count.load(Ordering::SeqCst) < self.capacity {
            let slot = state.sendx;
            state.buffer[slot] = Some(value);
            state.sendx = (slot + 1) % self.capacity;
            self.count.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        Err(value)
    }

    /// One attempt at receiver progress under the coordinator and state
    /// lock: drain the buffer head or take a parked sender's value
    /// directly. After a pop, the freed slot is refilled from the sender
    /// queue so FIFO hand-over order is preserved. Never commits a parked
    /// sender once the channel is closed; its value was never sent and the
    /// sender must fail instead.
    fn recv_ready(&self, state: &mut State<T>) -> Option<T> {
        if self.count.load(Ordering::SeqCst) > 0 {
            let slot = state.recvx;
            let value = state.buffer[slot].take().expect("counted slot is occupied");
            state.recvx = (slot + 1) % self.capacity;
            self.count.fetch_sub(1, Ordering::SeqCst);
            if !self.closed.load(Ordering::SeqCst) {
                if let Some(sender) = self.pop_waiter(state, Direction::Send) {
                    let refill = downcast_value::<T>(sender.commit_sender(self.id()));
                    let slot = state.sendx;
                    state.buffer[slot] = Some(refill);
                    state.sendx = (slot + 1) % self.capacity;
                    self.count.fetch_add(1, Ordering::SeqCst);
                    self.purge_waiter(state, &sender);
                    sender.signal();
                }
            }
            return Some(value);
        }
        if !self.closed.load(Ordering::SeqCst) {
            if let Some(sender) = self.pop_waiter(state, Direction::Send) {
                let value = downcast_value::<T>(sender.commit_sender(self.id()));
                self.purge_waiter(state, &sender);
                sender.signal();
                return Some(value);
            }
        }
        None
    }

    /// Racy pre-lock check: sending can be rejected without the lock when
    /// the channel is not closed and either no receiver is parked (capacity
    /// zero) or the buffer is full. Re-validated under the lock.
    fn send_would_block(&self) -> bool {
        if self.capacity == 0 {
            self.recv_waiters.load(Ordering::SeqCst) == 0
        } else {
            self.count.load(Ordering::SeqCst) == self.capacity
        }
    }

    /// Racy pre-lock check, symmetric to [`Shared::send_would_block`].
    fn recv_would_block(&self) -> bool {
        if self.capacity == 0 {
            self.send_waiters.load(Ordering::SeqCst) == 0
        } else {
            self.count.load(Ordering::SeqCst) == 0
        }
    }
}

impl<T: Send + 'static> Endpoint for Shared<T> {
    fn chan_id(&self) -> usize {
        self.id()
    }

    fn peek(&self) -> Peeked {
        let _coord = coordinator();
        if self.closed.load(Ordering::SeqCst) && self.count.load(Ordering::SeqCst) == 0 {
            return Peeked::Drained;
        }
        let mut state = self.state.lock();
        match self.recv_ready(&mut state) {
            Some(value) => Peeked::Value(Box::new(value)),
            None => Peeked::Empty,
        }
    }

    fn poke(&self, slot: &mut Option<Box<dyn Any + Send>>) -> Poked {
        let _coord = coordinator();
        if self.closed.load(Ordering::SeqCst) {
            return Poked::Closed;
        }
        let boxed = slot.take().expect("send offer retains its value");
        let value = downcast_value::<T>(boxed);
        let mut state = self.state.lock();
        match self.send_ready(&mut state, value) {
            Ok(()) => Poked::Sent,
            Err(value) => {
                *slot = Some(Box::new(value));
                Poked::Busy
            }
        }
    }

    fn register(&self, dir: Direction, ctx: &Arc<Context>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock();
        self.push_waiter(&mut state, dir, Arc::clone(ctx));
        true
    }

    fn deregister(&self, dir: Direction, ctx: &Context) -> bool {
        let mut state = self.state.lock();
        self.remove_waiter(&mut state, dir, ctx)
    }
}

/// A typed bounded channel supporting blocking send and receive, plus
/// close. Cheap to clone; all clones are handles to the same channel.
///
/// # Examples
///
/// ```
/// use rendezvous::Channel;
/// use std::thread;
///
/// let chan = Channel::new(0);
/// let tx = chan.clone();
/// let sender = thread::spawn(move || tx.send(7).unwrap());
/// assert_eq!(chan.recv(), Some(7));
/// sender.join().unwrap();
/// ```
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Channel<T> {
    /// Create a channel with a fixed `capacity`. A capacity of zero makes
    /// the channel a rendezvous point: a send completes only when a
    /// receiver takes the value.
    pub fn new(capacity: usize) -> Self {
        Channel {
            shared: Arc::new(Shared {
                capacity,
                closed: AtomicBool::new(false),
                count: AtomicUsize::new(0),
                send_waiters: AtomicUsize::new(0),
                recv_waiters: AtomicUsize::new(0),
                state: Mutex::new(State {
                    buffer: (0..capacity).map(|_| None).collect(),
                    sendx: 0,
                    recvx: 0,
                    sendq: VecDeque::new(),
                    recvq: VecDeque::new(),
                }),
            }),
        }
    }

    /// Send a value, parking the calling thread until a receiver or a
    /// buffer slot absorbs it. Fails with [`SendError`], returning the
    /// value, if the channel is closed before the hand-over happens.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        match self.dispatch(value, true) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(value)) => Err(SendError(value)),
            Err(TrySendError::Full(_)) => unreachable!("blocking send does not report full"),
        }
    }

    /// Send a value only if it can be delivered or buffered right now.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        if !self.shared.closed.load(Ordering::SeqCst) && self.shared.send_would_block() {
            return Err(TrySendError::Full(value));
        }
        self.dispatch(value, false)
    }

    /// Receive a value, parking the calling thread until one arrives.
    /// Returns `None` once the channel is closed and drained; every value
    /// sent before the close is still delivered first.
    pub fn recv(&self) -> Option<T> {
        self.receive(true).ok()
    }

    /// Receive a value only if one is available right now.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        if !self.shared.closed.load(Ordering::SeqCst) && self.shared.recv_would_block() {
            return Err(TryRecvError::Empty);
        }
        self.receive(false)
    }

    /// Close the channel. Idempotent. Every parked receiver wakes and
    /// observes the drained state; every parked sender wakes and fails.
    pub fn close(&self) {
        let shared = &self.shared;
        let _coord = coordinator();
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = shared.state.lock();
        debug!(
            capacity = shared.capacity,
            buffered = shared.count.load(Ordering::SeqCst),
            "channel closed"
        );
        while let Some(ctx) = shared.pop_waiter(&mut state, Direction::Recv) {
            ctx.signal();
        }
        while let Some(ctx) = shared.pop_waiter(&mut state, Direction::Send) {
            ctx.signal();
        }
    }

    /// The fixed capacity this channel was created with.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// The number of buffered values. May be stale under concurrent
    /// traffic; always within `0..=capacity`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// Whether the buffer is empty. Subject to the same staleness as
    /// [`Channel::len`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// A blocking iterator over received values, ending when the channel is
    /// closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { chan: self }
    }

    /// This channel as a type-erased selector endpoint.
    pub(crate) fn endpoint(&self) -> Arc<dyn Endpoint> {
        Arc::clone(&self.shared) as Arc<dyn Endpoint>
    }

    fn weak_endpoint(&self) -> Weak<dyn Endpoint> {
        Arc::downgrade(&self.shared) as Weak<dyn Endpoint>
    }

    fn dispatch(&self, value: T, block: bool) -> Result<(), TrySendError<T>> {
        let shared = &self.shared;
        let mut value = value;
        loop {
            let coord = coordinator();
            if shared.closed.load(Ordering::SeqCst) {
                return Err(TrySendError::Closed(value));
            }
            let ctx = Context::current();
            {
                let mut state = shared.state.lock();
                match shared.send_ready(&mut state, value) {
                    Ok(()) => return Ok(()),
                    Err(rejected) => value = rejected,
                }
                if !block {
                    return Err(TrySendError::Full(value));
                }
                ctx.add_offer(Offer::send(
                    self.weak_endpoint(),
                    shared.id(),
                    Box::new(value),
                ));
                shared.push_waiter(&mut state, Direction::Send, Arc::clone(&ctx));
            }
            drop(coord);

            loop {
                ctx.wait();
                let coord = coordinator();
                let still_queued = {
                    let state = shared.state.lock();
                    state.sendq.iter().any(|entry| is_ctx(entry, &ctx))
                };
                if still_queued {
                    // The consumed signal was a leftover from an earlier
                    // pairing that raced a close; keep waiting.
                    assert!(
                        ctx.unblocked_index().is_none(),
                        "context committed while still queued"
                    );
                    drop(coord);
                    continue;
                }
                match ctx.unblocked_index() {
                    Some(_) => {
                        // A receiver already took the value.
                        ctx.clear();
                        return Ok(());
                    }
                    None => {
                        // Woken by a close: reclaim the value and retry;
                        // the next pass observes the closed flag.
                        let mut offers = ctx.take_offers();
                        debug_assert_eq!(offers.len(), 1);
                        let reclaimed = offers
                            .pop()
                            .and_then(|mut offer| offer.take_value())
                            .expect("parked send offer retains its value");
                        value = downcast_value::<T>(reclaimed);
                        ctx.clear();
                        break;
                    }
                }
            }
        }
    }

    fn receive(&self, block: bool) -> Result<T, TryRecvError> {
        let shared = &self.shared;
        loop {
            let coord = coordinator();
            if shared.closed.load(Ordering::SeqCst) && shared.count.load(Ordering::SeqCst) == 0 {
                return Err(TryRecvError::Closed);
            }
            let ctx = Context::current();
            {
                let mut state = shared.state.lock();
                if let Some(value) = shared.recv_ready(&mut state) {
                    return Ok(value);
                }
                if !block {
                    return Err(TryRecvError::Empty);
                }
                ctx.add_offer(Offer::recv(self.weak_endpoint(), shared.id()));
                shared.push_waiter(&mut state, Direction::Recv, Arc::clone(&ctx));
            }
            drop(coord);

            loop {
                ctx.wait();
                let coord = coordinator();
                let still_queued = {
                    let state = shared.state.lock();
                    state.recvq.iter().any(|entry| is_ctx(entry, &ctx))
                };
                if still_queued {
                    assert!(
                        ctx.unblocked_index().is_none(),
                        "context committed while still queued"
                    );
                    drop(coord);
                    continue;
                }
                match ctx.unblocked_index() {
                    Some(_) => {
                        let boxed = ctx
                            .take_recv_slot()
                            .expect("committed receive carries a value");
                        let value = downcast_value::<T>(boxed);
                        ctx.clear();
                        return Ok(value);
                    }
                    None => {
                        // Woken by a close; the retry observes the drained
                        // state once the buffer is empty.
                        ctx.clear();
                        break;
                    }
                }
            }
        }
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.shared.capacity)
            .field("len", &self.shared.count.load(Ordering::SeqCst))
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Blocking iterator returned by [`Channel::iter`].
pub struct Iter<'a, T> {
    chan: &'a Channel<T>,
}

impl<T: Send + 'static> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.chan.recv()
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a Channel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_send_recv() {
        let chan = Channel::new(2);
        chan.send(1).unwrap();
        chan.send(2).unwrap();
        assert_eq!(chan.try_send(3), Err(TrySendError::Full(3)));
        assert_eq!(chan.recv(), Some(1));
        assert_eq!(chan.recv(), Some(2));
        assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_close_drains_buffer() {
        let chan = Channel::new(3);
        chan.send(10).unwrap();
        chan.send(20).unwrap();
        chan.close();
        assert_eq!(chan.recv(), Some(10));
        assert_eq!(chan.recv(), Some(20));
        assert_eq!(chan.recv(), None);
        assert_eq!(chan.recv(), None);
    }

    #[test]
    fn test_send_on_closed() {
        let chan = Channel::new(1);
        chan.close();
        assert_eq!(chan.send(5), Err(SendError(5)));
        assert!(chan.try_send(5).unwrap_err().is_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let chan = Channel::<u8>::new(1);
        chan.close();
        chan.close();
        assert!(chan.is_closed());
    }

    #[test]
    fn test_try_recv_closed_vs_empty() {
        let chan = Channel::<u8>::new(1);
        assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
        chan.close();
        assert_eq!(chan.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn test_rendezvous_try_ops_fail_without_peer() {
        let chan = Channel::new(0);
        assert_eq!(chan.try_send(1), Err(TrySendError::Full(1)));
        assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(chan.len(), 0);
    }

    #[test]
    fn test_len_stays_in_bounds() {
        let chan = Channel::new(2);
        assert_eq!(chan.capacity(), 2);
        assert!(chan.is_empty());
        chan.send(1).unwrap();
        assert_eq!(chan.len(), 1);
        chan.send(2).unwrap();
        assert_eq!(chan.len(), 2);
        assert_eq!(chan.recv(), Some(1));
        assert_eq!(chan.len(), 1);
    }

    #[test]
    fn test_ring_wraps_around() {
        let chan = Channel::new(2);
        for round in 0..5 {
            chan.send(round).unwrap();
            chan.send(round + 100).unwrap();
            assert_eq!(chan.recv(), Some(round));
            assert_eq!(chan.recv(), Some(round + 100));
        }
    }

    #[test]
    fn test_iter_drains_until_closed() {
        let chan = Channel::new(4);
        for i in 0..4 {
            chan.send(i).unwrap();
        }
        chan.close();
        let drained: Vec<i32> = chan.iter().collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_clone_shares_state() {
        let chan = Channel::new(1);
        let other = chan.clone();
        chan.send(9).unwrap();
        assert_eq!(other.recv(), Some(9));
        other.close();
        assert!(chan.is_closed());
    }
}
