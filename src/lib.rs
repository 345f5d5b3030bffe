//! CSP-style concurrency primitives for shared-memory threads.
//!
//! This crate provides communicating-sequential-processes building blocks
//! built on OS threads, a mutex and condition variables — no async runtime,
//! no event loop:
//!
//! - [`Channel<T>`] — a typed bounded channel with blocking send/receive,
//!   non-blocking variants, and close. Capacity zero makes it a rendezvous
//!   point where senders and receivers meet directly.
//! - [`Selector`] — blocks on any mix of pending sends and receives across
//!   channels of different element types and commits exactly one, chosen
//!   starting from a random offer so simultaneously-ready offers are picked
//!   without bias.
//! - [`Scheduler`] — a deadline-ordered task queue driven by caller
//!   threads.
//! - [`Ticker`] — a periodic `true` signal delivered through a channel.
//!
//! # Guarantees
//!
//! - Per channel, parked waiters are served strictly FIFO.
//! - A value sent to a channel with a parked receiver is handed directly to
//!   that receiver, never buffered past it.
//! - After [`Channel::close`], every previously sent value is still
//!   received, then receives report end-of-stream; parked senders fail.
//! - A selector commits exactly one offer per call and leaves no residual
//!   registration on any channel.
//!
//! # Example
//!
//! ```
//! use rendezvous::{Channel, Selector};
//! use std::thread;
//!
//! let work: Channel<u32> = Channel::new(4);
//! let done: Channel<u32> = Channel::new(0);
//!
//! let (tx, rx) = (work.clone(), done.clone());
//! let worker = thread::spawn(move || {
//!     let mut total = 0;
//!     while let Some(n) = tx.recv() {
//!         total += n;
//!     }
//!     rx.send(total).unwrap();
//! });
//!
//! for n in 1..=10 {
//!     work.send(n).unwrap();
//! }
//! work.close();
//!
//! let mut sel = Selector::new();
//! sel.recv(&done);
//! assert_eq!(sel.select(), Ok(0));
//! assert_eq!(sel.get_data::<u32>(), Some(55));
//! worker.join().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod channel;
mod context;
mod error;
mod random;
mod scheduler;
mod selector;
mod ticker;

pub use channel::{Channel, Iter};
pub use error::{SelectError, SendError, TryRecvError, TrySendError};
pub use scheduler::Scheduler;
pub use selector::Selector;
pub use ticker::Ticker;
