//! Per-thread pairing state.
//!
//! Every thread that parks on a channel or a selector owns one [`Context`],
//! created lazily on first use and reused for the thread's lifetime. A
//! context records the operations the thread is currently offering, carries
//! the counted semaphore the thread parks on, and latches the index of the
//! offer a counterparty committed.
//!
//! # Locking
//!
//! One process-wide coordinator mutex serializes every pairing operation:
//! channel sends, receives and closes, selector registration, and commits.
//! The per-object mutexes on channel state and context state exist to hand
//! out mutable access safely; they are only ever acquired with the
//! coordinator held, so they never contend and their nesting order cannot
//! deadlock. The semaphore a thread parks on is the one exception: its
//! internal lock is taken without the coordinator, and nothing else is
//! locked while it is held.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::channel::Endpoint;
use crate::random::random_index;

static COORDINATOR: Mutex<()> = Mutex::new(());

/// Acquire the process-wide coordinator mutex.
pub(crate) fn coordinator() -> MutexGuard<'static, ()> {
    COORDINATOR.lock()
}

thread_local! {
    static CURRENT: Arc<Context> = Arc::new(Context::new());
}

/// Which side of a channel an offer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Offering a value to the channel.
    Send,
    /// Asking the channel for a value.
    Recv,
}

/// One pending operation a thread is offering to a channel.
pub(crate) struct Offer {
    /// The erased channel. Weak so a context never keeps a channel alive;
    /// the call frame that created the offer holds a strong handle.
    chan: Weak<dyn Endpoint>,
    /// Stable identity of the channel, valid while the offer exists.
    chan_id: usize,
    dir: Direction,
    /// Outgoing value of a send offer, present until a counterparty or the
    /// offering thread takes it back.
    value: Option<Box<dyn Any + Send>>,
}

impl Offer {
    pub(crate) fn send(
        chan: Weak<dyn Endpoint>,
        chan_id: usize,
        value: Box<dyn Any + Send>,
    ) -> Self {
        Offer {
            chan,
            chan_id,
            dir: Direction::Send,
            value: Some(value),
        }
    }

    pub(crate) fn recv(chan: Weak<dyn Endpoint>, chan_id: usize) -> Self {
        Offer {
            chan,
            chan_id,
            dir: Direction::Recv,
            value: None,
        }
    }

    pub(crate) fn take_value(&mut self) -> Option<Box<dyn Any + Send>> {
        self.value.take()
    }
}

/// Counted semaphore. Counted rather than binary so a signal that lands
/// before the paired `wait` has started still wakes it.
struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Semaphore {
            count: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }
}

struct State {
    offers: Vec<Offer>,
    /// Index into `offers` of the committed operation; `None` outside the
    /// commit phase of a successful pairing.
    unblocked: Option<usize>,
    /// Value delivered by a committing sender.
    recv_slot: Option<Box<dyn Any + Send>>,
}

/// Per-thread waiting state bridging `wait` and `signal` across channels.
pub(crate) struct Context {
    sem: Semaphore,
    state: Mutex<State>,
}

impl Context {
    fn new() -> Self {
        Context {
            sem: Semaphore::new(),
            state: Mutex::new(State {
                offers: Vec::new(),
                unblocked: None,
                recv_slot: None,
            }),
        }
    }

    /// The calling thread's context, created on first use.
    pub(crate) fn current() -> Arc<Context> {
        CURRENT.with(Arc::clone)
    }

    /// Wake the owning thread, or its next `wait`.
    pub(crate) fn signal(&self) {
        self.sem.signal();
    }

    /// Park until signalled. Never called with the coordinator held.
    pub(crate) fn wait(&self) {
        self.sem.wait();
    }

    /// Append one offer. Coordinator held by the caller.
    pub(crate) fn add_offer(&self, offer: Offer) {
        self.state.lock().offers.push(offer);
    }

    /// Install a whole offer list. The context must be idle.
    pub(crate) fn install_offers(&self, offers: Vec<Offer>) {
        let mut state = self.state.lock();
        debug_assert!(state.offers.is_empty());
        state.offers = offers;
    }

    /// Take the offer list back out, reclaiming unsent values after a
    /// wakeup that committed nothing. Coordinator held by the caller.
    pub(crate) fn take_offers(&self) -> Vec<Offer> {
        std::mem::take(&mut self.state.lock().offers)
    }

    pub(crate) fn offers_is_empty(&self) -> bool {
        self.state.lock().offers.is_empty()
    }

    pub(crate) fn unblocked_index(&self) -> Option<usize> {
        self.state.lock().unblocked
    }

    pub(crate) fn take_recv_slot(&self) -> Option<Box<dyn Any + Send>> {
        self.state.lock().recv_slot.take()
    }

    /// Reset to the idle state: no offers, no commit, no received value.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.unblocked = None;
        state.recv_slot = None;
        state.offers.clear();
    }

    /// Register this context on every offered channel's queue, routed by
    /// direction. Stops and reports `false` if a channel refuses because it
    /// closed since the offers were polled; the caller unwinds and repolls.
    /// Coordinator held by the caller.
    pub(crate) fn add_to_all_channels(self: &Arc<Self>) -> bool {
        let state = self.state.lock();
        for offer in &state.offers {
            if let Some(chan) = offer.chan.upgrade() {
                if !chan.register(offer.dir, self) {
                    return false;
                }
            }
        }
        true
    }

    /// Remove this context from every offered channel's queue. Tolerates
    /// registrations already removed by a commit or a close. Coordinator
    /// held by the caller.
    pub(crate) fn remove_from_all_channels(&self) {
        let state = self.state.lock();
        for offer in &state.offers {
            if let Some(chan) = offer.chan.upgrade() {
                chan.deregister(offer.dir, self);
            }
        }
    }

    /// Commit this context's pending send on `chan_id` and return the
    /// offered value. Called by the receiving counterparty with the
    /// coordinator held.
    pub(crate) fn commit_sender(&self, chan_id: usize) -> Box<dyn Any + Send> {
        self.commit(chan_id, Direction::Send, None)
            .expect("send offer retains its value until committed")
    }

    /// Commit this context's pending receive on `chan_id`, delivering
    /// `value` into its receive slot. Called by the sending counterparty
    /// with the coordinator held.
    pub(crate) fn commit_receiver(&self, chan_id: usize, value: Box<dyn Any + Send>) {
        self.commit(chan_id, Direction::Recv, Some(value));
    }

    /// Shared commit path: latch the first offer matching `chan_id` and
    /// `dir`, scanning cyclically from a random start so a context parked
    /// more than once on one channel shows no positional bias, then
    /// deregister every offer on other channels and clear the offer list.
    /// Entries on the committing channel's own queues are left for that
    /// channel to purge; it already holds its own state lock.
    fn commit(
        &self,
        chan_id: usize,
        dir: Direction,
        value: Option<Box<dyn Any + Send>>,
    ) -> Option<Box<dyn Any + Send>> {
        let mut state = self.state.lock();
        let len = state.offers.len();
        assert!(len > 0, "commit on a context with no offers");
        let mut committed: Option<usize> = None;
        let mut taken: Option<Box<dyn Any + Send>> = None;
        let mut i = random_index(len);
        for _ in 0..len {
            let offer_dir = state.offers[i].dir;
            let offer_chan = state.offers[i].chan_id;
            if committed.is_none() && offer_chan == chan_id && offer_dir == dir {
                committed = Some(i);
                taken = state.offers[i].take_value();
            } else if offer_chan != chan_id {
                if let Some(chan) = state.offers[i].chan.upgrade() {
                    chan.deregister(offer_dir, self);
                }
            }
            i = (i + 1) % len;
        }
        let index = committed.expect("no offer for the committing channel");
        state.unblocked = Some(index);
        state.recv_slot = value;
        state.offers.clear();
        taken
    }
}
