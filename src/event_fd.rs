use std::io;
use std::mem;
use std::os::unix::io::RawFd;

/// A nonblocking eventfd used to force a blocked poller wait to return.
///
/// Writing a token makes the descriptor read-ready; reading drains the
/// counter again. This is the only descriptor the reactor core owns.
pub(crate) struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Adds `val` to the eventfd counter, arming read readiness.
    pub fn write_u64(&self, val: u64) -> io::Result<()> {
        let nwritten = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        check_transfer_size(nwritten, "write")
    }

    /// Drains the eventfd counter, returning the accumulated value.
    pub fn read_u64(&self) -> io::Result<u64> {
        let mut val: u64 = 0;
        let nread = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        check_transfer_size(nread, "read")?;
        Ok(val)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        let ret = unsafe { libc::close(self.fd) };
        debug_assert_eq!(ret, 0);
    }
}

fn check_transfer_size(transferred: isize, op: &str) -> io::Result<()> {
    if transferred < 0 {
        return Err(io::Error::last_os_error());
    }
    if transferred as usize != mem::size_of::<u64>() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("eventfd {} moved {} bytes instead of 8", op, transferred),
        ));
    }
    Ok(())
}
