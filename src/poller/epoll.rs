use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::{debug, error, trace};

use super::{Poller, INDEX_NEW};
use crate::channel::Channel;
use crate::io_events::IoEvents;
use crate::timestamp::Timestamp;

// Registration phases kept in a channel's backend slot. A detached
// channel is still known here but has been EPOLL_CTL_DEL'd because its
// interest set went empty.
const INDEX_ADDED: i32 = 1;
const INDEX_DETACHED: i32 = 2;

const INITIAL_EVENT_BUF: usize = 16;

/// The epoll(7)-backed multiplexer, the default on Linux.
pub struct EpollPoller {
    epoll_fd: RawFd,
    // Kernel-filled buffer, doubled whenever a wait comes back full.
    event_buf: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            event_buf: vec![unsafe { mem::zeroed() }; INITIAL_EVENT_BUF],
            channels: HashMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut raw_event = libc::epoll_event {
            events: io_events_to_epoll(channel.events()),
            u64: channel.fd() as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, channel.fd(), &mut raw_event) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl del fd={} failed: {}", channel.fd(), err);
            } else {
                error!("epoll_ctl op={} fd={} failed: {}", op, channel.fd(), err);
                panic!("cannot register fd {} with epoll: {}", channel.fd(), err);
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Timestamp {
        trace!("epoll wait over {} channels", self.channels.len());
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.event_buf.as_mut_ptr(),
                self.event_buf.len() as libc::c_int,
                timeout_ms,
            )
        };
        let receive_time = Timestamp::now();

        if num_events < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!("epoll_wait failed: {}", err);
            }
            return receive_time;
        }
        if num_events == 0 {
            trace!("nothing happened before the timeout");
            return receive_time;
        }

        debug!("{} channels ready", num_events);
        for raw_event in &self.event_buf[..num_events as usize] {
            let fd = raw_event.u64 as RawFd;
            let channel = match self.channels.get(&fd) {
                Some(channel) => channel,
                None => {
                    debug_assert!(false, "epoll reported unknown fd {}", fd);
                    continue;
                }
            };
            channel.set_revents(io_events_from_epoll(raw_event.events));
            active_channels.push(Rc::clone(channel));
        }
        if num_events as usize == self.event_buf.len() {
            let doubled = self.event_buf.len() * 2;
            self.event_buf.resize(doubled, unsafe { mem::zeroed() });
        }
        receive_time
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let index = channel.index();
        trace!(
            "update fd={} events={} index={}",
            channel.fd(),
            channel.events_to_string(),
            index
        );
        if index == INDEX_NEW || index == INDEX_DETACHED {
            if index == INDEX_NEW {
                self.channels.insert(channel.fd(), Rc::clone(channel));
            } else {
                debug_assert!(self.channels.contains_key(&channel.fd()));
            }
            channel.set_index(INDEX_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else {
            debug_assert_eq!(index, INDEX_ADDED);
            debug_assert!(self.channels.contains_key(&channel.fd()));
            if channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_DETACHED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        trace!("remove fd={}", fd);
        debug_assert!(self.channels.contains_key(&fd));
        debug_assert!(channel.is_none_event());
        self.channels.remove(&fd);
        if channel.index() == INDEX_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(found) => std::ptr::eq(Rc::as_ptr(found), channel),
            None => false,
        }
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        let ret = unsafe { libc::close(self.epoll_fd) };
        debug_assert_eq!(ret, 0);
    }
}

// Explicit per-bit conversion; the values coincide on Linux but the
// poller does not rely on that.
fn io_events_to_epoll(events: IoEvents) -> u32 {
    let mut raw: u32 = 0;
    if events.contains(IoEvents::IN) {
        raw |= libc::EPOLLIN as u32;
    }
    if events.contains(IoEvents::PRI) {
        raw |= libc::EPOLLPRI as u32;
    }
    if events.contains(IoEvents::OUT) {
        raw |= libc::EPOLLOUT as u32;
    }
    raw
}

fn io_events_from_epoll(raw: u32) -> IoEvents {
    let mut events = IoEvents::empty();
    if raw & libc::EPOLLIN as u32 != 0 {
        events |= IoEvents::IN;
    }
    if raw & libc::EPOLLPRI as u32 != 0 {
        events |= IoEvents::PRI;
    }
    if raw & libc::EPOLLOUT as u32 != 0 {
        events |= IoEvents::OUT;
    }
    if raw & libc::EPOLLERR as u32 != 0 {
        events |= IoEvents::ERR;
    }
    if raw & libc::EPOLLHUP as u32 != 0 {
        events |= IoEvents::HUP;
    }
    if raw & libc::EPOLLRDHUP as u32 != 0 {
        events |= IoEvents::RDHUP;
    }
    events
}
