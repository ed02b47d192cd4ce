//! The reactor core of an event-driven network library.
//!
//! One [`EventLoop`] runs per thread and multiplexes readiness
//! notifications across file descriptors, dispatching them to the
//! callbacks registered on [`Channel`]s. Everything that touches a loop's
//! channels is confined to the loop's own thread; foreign threads inject
//! work through [`LoopHandle::run_in_loop`] and wake a blocked wait
//! through a dedicated eventfd.
//!
//! The pieces, leaves first:
//!
//! * [`IoEvents`] is the bitset shared by interest registration and
//!   readiness reporting.
//! * [`Channel`] binds one descriptor to an interest set and up to four
//!   callbacks (readable, writable, closed, error). It never owns the
//!   descriptor.
//! * [`Poller`] is the seam to the readiness backend; [`EpollPoller`] is
//!   the Linux default and [`PollPoller`] the portable fallback.
//! * [`EventLoop`] owns one poller and drives the wait/dispatch/drain
//!   cycle until [`LoopHandle::quit`] takes effect.

mod channel;
mod event_fd;
mod event_loop;
mod io_events;
pub mod poller;
mod registry;
mod timestamp;

pub use self::channel::{Channel, EventCallback, ReadCallback};
pub use self::event_loop::{EventLoop, LoopHandle, Task};
pub use self::io_events::IoEvents;
pub use self::poller::{new_default_poller, EpollPoller, PollPoller, Poller};
pub use self::registry::{current, thread_registry, LoopRegistry};
pub use self::timestamp::Timestamp;
