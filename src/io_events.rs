use bitflags::bitflags;

bitflags! {
    /// I/O readiness bits, using the bit values of poll(2).
    ///
    /// The same type serves as a channel's interest set and as the event
    /// set a poller reports back. The epoll backend converts to and from
    /// `epoll_event.events` explicitly even though the bit values
    /// coincide on Linux.
    pub struct IoEvents: u32 {
        const IN    = libc::POLLIN as u32;
        const PRI   = libc::POLLPRI as u32;
        const OUT   = libc::POLLOUT as u32;
        const ERR   = libc::POLLERR as u32;
        const HUP   = libc::POLLHUP as u32;
        const NVAL  = libc::POLLNVAL as u32;
        const RDHUP = libc::POLLRDHUP as u32;

        /// Read interest: normal data plus urgent data.
        const READ  = Self::IN.bits | Self::PRI.bits;
        /// Write interest.
        const WRITE = Self::OUT.bits;
    }
}
