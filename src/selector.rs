//! Waiting on one of several channel operations.
//!
//! A [`Selector`] accumulates *offers* — sends and receives addressing any
//! mix of channels, of any element types — and commits exactly one of them.
//! The polling pass starts at a uniformly random offer so that no offer is
//! consistently preferred when several are ready at once; within a single
//! channel the FIFO order of parked waiters still holds.
//!
//! # Examples
//!
//! ```
//! use rendezvous::{Channel, Selector};
//!
//! let a = Channel::new(1);
//! let b: Channel<i32> = Channel::new(1);
//! a.send(42).unwrap();
//!
//! let mut sel = Selector::new();
//! sel.recv(&a).recv(&b);
//! assert_eq!(sel.select().unwrap(), 0);
//! assert_eq!(sel.get_data::<i32>(), Some(42));
//! ```

use std::any::Any;
use std::sync::Arc;

use crate::channel::{downcast_value, Channel, Endpoint, Peeked, Poked};
use crate::context::{coordinator, Context, Direction, Offer};
use crate::error::SelectError;
use crate::random::random_index;

struct SelOffer {
    chan: Arc<dyn Endpoint>,
    dir: Direction,
    /// Outgoing value of a send offer. Travels into the context while the
    /// thread is parked and is reclaimed on a wakeup without a commit.
    value: Option<Box<dyn Any + Send>>,
}

/// Commits exactly one of several pending channel operations.
///
/// Offers are indexed by insertion order; that index is what
/// [`Selector::select`] returns. A `select` or `try_select` call consumes
/// the accumulated offers, so a new round starts from an empty selector.
#[derive(Default)]
pub struct Selector {
    offers: Vec<SelOffer>,
    data: Option<Box<dyn Any + Send>>,
}

impl Selector {
    /// Create an empty selector.
    pub fn new() -> Self {
        Selector {
            offers: Vec::new(),
            data: None,
        }
    }

    /// Offer to send `value` on `chan`.
    pub fn send<T: Send + 'static>(&mut self, chan: &Channel<T>, value: T) -> &mut Self {
        self.offers.push(SelOffer {
            chan: chan.endpoint(),
            dir: Direction::Send,
            value: Some(Box::new(value)),
        });
        self
    }

    /// Offer to receive a value from `chan`.
    pub fn recv<T: Send + 'static>(&mut self, chan: &Channel<T>) -> &mut Self {
        self.offers.push(SelOffer {
            chan: chan.endpoint(),
            dir: Direction::Recv,
            value: None,
        });
        self
    }

    /// Drop all accumulated offers and any held value.
    pub fn clear(&mut self) {
        self.offers.clear();
        self.data = None;
    }

    /// Block until exactly one offer commits and return its index. A
    /// committed receive stores its value for [`Selector::get_data`]; a
    /// receive committing against a closed, drained channel stores nothing,
    /// the end-of-stream case.
    ///
    /// Fails with [`SelectError::Closed`] when a send offer addresses a
    /// closed channel.
    ///
    /// # Panics
    ///
    /// Panics when called with no offers; such a select could never return.
    pub fn select(&mut self) -> Result<usize, SelectError> {
        self.run(true)
            .map(|index| index.expect("blocking select always commits an offer"))
    }

    /// Attempt each offer once without blocking. `Ok(None)` means no offer
    /// was ready.
    pub fn try_select(&mut self) -> Result<Option<usize>, SelectError> {
        self.run(false)
    }

    /// Take the value received by the committed offer. `None` after a send
    /// commit or an end-of-stream receive.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the element type of the committed offer's
    /// channel.
    pub fn get_data<T: 'static>(&mut self) -> Option<T> {
        self.data.take().map(downcast_value::<T>)
    }

    fn run(&mut self, block: bool) -> Result<Option<usize>, SelectError> {
        let mut offers = std::mem::take(&mut self.offers);
        self.data = None;
        if offers.is_empty() {
            assert!(!block, "select on an empty offer set would never return");
            return Ok(None);
        }
        let ctx = Context::current();
        loop {
            // Polling pass: attempt each offer without blocking, cyclically
            // from a random start.
            let len = offers.len();
            let mut i = random_index(len);
            for _ in 0..len {
                let offer = &mut offers[i];
                match offer.dir {
                    Direction::Recv => match offer.chan.peek() {
                        Peeked::Value(value) => {
                            self.data = Some(value);
                            return Ok(Some(i));
                        }
                        // A drained channel is ready: the receive completes
                        // with no value.
                        Peeked::Drained => return Ok(Some(i)),
                        Peeked::Empty => {}
                    },
                    Direction::Send => match offer.chan.poke(&mut offer.value) {
                        Poked::Sent => return Ok(Some(i)),
                        Poked::Closed => return Err(SelectError::Closed),
                        Poked::Busy => {}
                    },
                }
                i = (i + 1) % len;
            }

            if !block {
                return Ok(None);
            }

            // Nothing ready: park on every offered channel and wait for a
            // counterparty to commit exactly one offer.
            let coord = coordinator();
            let installed = offers
                .iter_mut()
                .map(|offer| match offer.dir {
                    Direction::Send => Offer::send(
                        Arc::downgrade(&offer.chan),
                        offer.chan.chan_id(),
                        offer.value.take().expect("send offer retains its value"),
                    ),
                    Direction::Recv => {
                        Offer::recv(Arc::downgrade(&offer.chan), offer.chan.chan_id())
                    }
                })
                .collect();
            ctx.install_offers(installed);
            if ctx.add_to_all_channels() {
                drop(coord);
                ctx.wait();
                let _coord = coordinator();
                match ctx.unblocked_index() {
                    Some(index) => {
                        assert!(
                            ctx.offers_is_empty(),
                            "context still holds offers after a committed selection"
                        );
                        self.data = ctx.take_recv_slot();
                        ctx.clear();
                        return Ok(Some(index));
                    }
                    // Woken without a commit: a channel closed, or a stale
                    // signal landed. Unwind and repoll; the polling pass
                    // classifies closed channels.
                    None => Self::unwind(&ctx, &mut offers),
                }
            } else {
                // A channel closed between the poll and the registration.
                Self::unwind(&ctx, &mut offers);
            }
        }
    }

    /// Deregister everywhere, take the offers back reclaiming unsent
    /// values, and reset the context. Coordinator held by the caller.
    fn unwind(ctx: &Arc<Context>, offers: &mut [SelOffer]) {
        ctx.remove_from_all_channels();
        let reclaimed = ctx.take_offers();
        for (local, mut installed) in offers.iter_mut().zip(reclaimed) {
            if local.dir == Direction::Send {
                local.value = installed.take_value();
            }
        }
        ctx.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TryRecvError;

    #[test]
    fn test_try_select_nothing_ready() {
        let a: Channel<i32> = Channel::new(1);
        let b: Channel<i32> = Channel::new(0);
        let mut sel = Selector::new();
        sel.recv(&a).recv(&b);
        assert_eq!(sel.try_select(), Ok(None));
    }

    #[test]
    fn test_select_ready_recv() {
        let a = Channel::new(1);
        let b: Channel<i32> = Channel::new(1);
        a.send(42).unwrap();
        let mut sel = Selector::new();
        sel.recv(&a).recv(&b);
        assert_eq!(sel.select(), Ok(0));
        assert_eq!(sel.get_data::<i32>(), Some(42));
    }

    #[test]
    fn test_select_ready_send_buffers_value() {
        let chan: Channel<i32> = Channel::new(1);
        let mut sel = Selector::new();
        sel.send(&chan, 5);
        assert_eq!(sel.select(), Ok(0));
        assert_eq!(sel.get_data::<i32>(), None);
        assert_eq!(chan.recv(), Some(5));
    }

    #[test]
    fn test_select_recv_on_drained_channel() {
        let chan: Channel<i32> = Channel::new(1);
        chan.close();
        let mut sel = Selector::new();
        sel.recv(&chan);
        assert_eq!(sel.select(), Ok(0));
        assert_eq!(sel.get_data::<i32>(), None);
    }

    #[test]
    fn test_select_send_on_closed_channel() {
        let chan: Channel<i32> = Channel::new(1);
        chan.close();
        let mut sel = Selector::new();
        sel.send(&chan, 1);
        assert_eq!(sel.select(), Err(SelectError::Closed));
    }

    #[test]
    fn test_offers_are_consumed_per_round() {
        let chan = Channel::new(1);
        chan.send(1).unwrap();
        let mut sel = Selector::new();
        sel.recv(&chan);
        assert_eq!(sel.try_select(), Ok(Some(0)));
        // the next round starts empty
        assert_eq!(sel.try_select(), Ok(None));
    }

    #[test]
    fn test_clear_discards_offers() {
        let chan = Channel::new(1);
        chan.send(3).unwrap();
        let mut sel = Selector::new();
        sel.recv(&chan);
        sel.clear();
        assert_eq!(sel.try_select(), Ok(None));
        assert_eq!(chan.try_recv(), Ok(3));
        assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    #[should_panic(expected = "empty offer set")]
    fn test_blocking_select_without_offers_panics() {
        let mut sel = Selector::new();
        let _ = sel.select();
    }
}
