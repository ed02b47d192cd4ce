//! The readiness-multiplexing seam between the event loop and the OS.
//!
//! A [`Poller`] waits for readiness across every registered channel and
//! reports which became active. Backends are confined to the loop's
//! thread like everything else that touches channels; the loop is the
//! only caller.

mod epoll;
mod poll;

use std::env;
use std::io;
use std::rc::Rc;

use crate::channel::Channel;
use crate::timestamp::Timestamp;

pub use self::epoll::EpollPoller;
pub use self::poll::PollPoller;

/// Backend-slot value of a channel no poller has seen yet.
pub(crate) const INDEX_NEW: i32 = -1;

/// Environment variable forcing the portable poll(2) backend.
const USE_POLL_ENV: &str = "EVLOOP_USE_POLL";

/// A readiness multiplexer driving one event loop.
pub trait Poller {
    /// Waits up to `timeout_ms` for registered descriptors to become
    /// ready, appends the ready channels (reported events recorded via
    /// `Channel::set_revents`) to `active_channels`, and returns the
    /// time the wait returned.
    ///
    /// A benign interruption (EINTR) yields an empty batch.
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Timestamp;

    /// Registers a new channel, or refreshes the registration of a known
    /// one after its interest set changed.
    fn update_channel(&mut self, channel: &Rc<Channel>);

    /// Deregisters a channel. Its interest set must already be empty.
    fn remove_channel(&mut self, channel: &Rc<Channel>);

    /// Whether exactly this channel is currently registered here.
    fn has_channel(&self, channel: &Channel) -> bool;
}

/// Creates the default backend for this platform: epoll on Linux unless
/// `EVLOOP_USE_POLL` is set, poll(2) otherwise.
pub fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    if cfg!(target_os = "linux") && env::var_os(USE_POLL_ENV).is_none() {
        return Ok(Box::new(EpollPoller::new()?));
    }
    Ok(Box::new(PollPoller::new()))
}
