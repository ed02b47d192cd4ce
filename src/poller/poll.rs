use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::{debug, error, trace};

use super::Poller;
use crate::channel::Channel;
use crate::io_events::IoEvents;
use crate::timestamp::Timestamp;

/// The portable poll(2)-backed multiplexer.
///
/// Keeps a `pollfd` mirror of every registered channel; a channel's
/// backend slot is its position in that vector. An entry whose interest
/// set is empty stays in place with a negated descriptor so the kernel
/// ignores it.
pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl PollPoller {
    pub fn new() -> Self {
        Self {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }
}

impl Default for PollPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Timestamp {
        trace!("poll over {} descriptors", self.pollfds.len());
        let num_events = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let receive_time = Timestamp::now();

        if num_events < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!("poll failed: {}", err);
            }
            return receive_time;
        }
        if num_events == 0 {
            trace!("nothing happened before the timeout");
            return receive_time;
        }

        debug!("{} descriptors ready", num_events);
        let mut remaining = num_events;
        for pollfd in &self.pollfds {
            if remaining == 0 {
                break;
            }
            if pollfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            let channel = match self.channels.get(&pollfd.fd) {
                Some(channel) => channel,
                None => {
                    debug_assert!(false, "poll reported unknown fd {}", pollfd.fd);
                    continue;
                }
            };
            let revents = IoEvents::from_bits_truncate(pollfd.revents as u16 as u32);
            channel.set_revents(revents);
            active_channels.push(Rc::clone(channel));
        }
        receive_time
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        trace!(
            "update fd={} events={}",
            channel.fd(),
            channel.events_to_string()
        );
        if channel.index() < 0 {
            // A new channel: append a pollfd and remember the position.
            debug_assert!(!self.channels.contains_key(&channel.fd()));
            self.pollfds.push(libc::pollfd {
                fd: channel.fd(),
                events: channel.events().bits() as i16,
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as i32 - 1);
            self.channels.insert(channel.fd(), Rc::clone(channel));
        } else {
            debug_assert!(self.channels.contains_key(&channel.fd()));
            let index = channel.index() as usize;
            debug_assert!(index < self.pollfds.len());
            let pollfd = &mut self.pollfds[index];
            debug_assert!(pollfd.fd == channel.fd() || pollfd.fd == ignored_fd(channel.fd()));
            pollfd.fd = channel.fd();
            pollfd.events = channel.events().bits() as i16;
            pollfd.revents = 0;
            if channel.is_none_event() {
                pollfd.fd = ignored_fd(channel.fd());
            }
        }
    }

    fn remove_channel(&mut self, channel: &Rc<Channel>) {
        trace!("remove fd={}", channel.fd());
        debug_assert!(channel.is_none_event());
        let removed = self.channels.remove(&channel.fd());
        debug_assert!(removed.is_some());

        let index = channel.index() as usize;
        debug_assert!(index < self.pollfds.len());
        self.pollfds.swap_remove(index);
        if index < self.pollfds.len() {
            // Fix the backend slot of the entry that got swapped in.
            let mut moved_fd = self.pollfds[index].fd;
            if moved_fd < 0 {
                moved_fd = ignored_fd(moved_fd);
            }
            if let Some(moved) = self.channels.get(&moved_fd) {
                moved.set_index(index as i32);
            } else {
                debug_assert!(false, "pollfd entry for unknown fd {}", moved_fd);
            }
        }
        channel.set_index(super::INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(found) => std::ptr::eq(Rc::as_ptr(found), channel),
            None => false,
        }
    }
}

// poll(2) skips negative descriptors. The -fd - 1 mapping stays
// reversible for fd 0 and is its own inverse.
fn ignored_fd(fd: RawFd) -> RawFd {
    -fd - 1
}
