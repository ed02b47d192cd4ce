use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use log::trace;

use crate::event_loop::EventLoop;
use crate::io_events::IoEvents;
use crate::poller::INDEX_NEW;
use crate::timestamp::Timestamp;

/// Callback invoked when the descriptor becomes readable. Receives the
/// time at which the poller wait returned.
pub type ReadCallback = Box<dyn FnMut(Timestamp)>;

/// Callback invoked for writable, peer-closed, and error conditions.
pub type EventCallback = Box<dyn FnMut()>;

/// The binding of one file descriptor to an interest set and its event
/// callbacks.
///
/// A channel never owns its descriptor; the caller keeps it open for as
/// long as the channel is registered and closes it afterwards. All
/// fields use single-thread interior mutability, so the type is `!Send`
/// and every mutation is confined to the owning loop's thread by
/// construction.
///
/// A registered channel must be deregistered with [`Channel::remove`]
/// (after disabling all interest) before it is dropped.
pub struct Channel {
    event_loop: Weak<EventLoop>,
    fd: RawFd,
    // Interest set, registered with the poller on every change.
    events: Cell<IoEvents>,
    // Events the poller reported in the current dispatch cycle.
    revents: Cell<IoEvents>,
    // Opaque backend bookkeeping slot; the poller tracks its
    // registration phase here.
    index: Cell<i32>,
    tied: Cell<bool>,
    tie: RefCell<Option<Weak<dyn Any>>>,
    added_to_loop: Cell<bool>,
    read_callback: RefCell<Option<ReadCallback>>,
    write_callback: RefCell<Option<EventCallback>>,
    close_callback: RefCell<Option<EventCallback>>,
    error_callback: RefCell<Option<EventCallback>>,
    weak_self: Weak<Channel>,
}

impl Channel {
    /// Creates a channel bound to `event_loop` and `fd`, with empty
    /// interest and no callbacks.
    pub fn new(event_loop: &Rc<EventLoop>, fd: RawFd) -> Rc<Self> {
        Self::new_bound(Rc::downgrade(event_loop), fd)
    }

    pub(crate) fn new_bound(event_loop: Weak<EventLoop>, fd: RawFd) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            event_loop,
            fd,
            events: Cell::new(IoEvents::empty()),
            revents: Cell::new(IoEvents::empty()),
            index: Cell::new(INDEX_NEW),
            tied: Cell::new(false),
            tie: RefCell::new(None),
            added_to_loop: Cell::new(false),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn set_read_callback(&self, callback: impl FnMut(Timestamp) + 'static) {
        *self.read_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_write_callback(&self, callback: impl FnMut() + 'static) {
        *self.write_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_close_callback(&self, callback: impl FnMut() + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl FnMut() + 'static) {
        *self.error_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Ties the channel to a liveness witness.
    ///
    /// Once tied, every dispatch first upgrades the witness and holds the
    /// strong reference across the callbacks; if the witness has expired,
    /// the dispatch is silently skipped. This is the cancellation path
    /// for callbacks whose logical owner has already been destroyed, not
    /// an error.
    pub fn tie<T: 'static>(&self, witness: &Rc<T>) {
        // Downgrade first, then unsize; annotating the `downgrade` call
        // itself would force `T = dyn Any` during inference.
        let witness = Rc::downgrade(witness);
        let witness: Weak<dyn Any> = witness;
        *self.tie.borrow_mut() = Some(witness);
        self.tied.set(true);
    }

    /// Dispatches the most recently reported events to the registered
    /// callbacks.
    pub fn handle_event(&self, receive_time: Timestamp) {
        if self.tied.get() {
            let witness = self.tie.borrow().as_ref().and_then(Weak::upgrade);
            if let Some(_witness) = witness {
                // `_witness` keeps the owner alive across the callbacks.
                self.handle_event_with_guard(receive_time);
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    // The four checks are independent; more than one may fire per
    // dispatch (e.g. error plus read), except that a hangup only maps to
    // the close callback when no read readiness accompanies it.
    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        let revents = self.revents.get();
        trace!("channel fd={} dispatching {:?}", self.fd, revents);

        if revents.contains(IoEvents::HUP) && !revents.contains(IoEvents::IN) {
            invoke(&self.close_callback);
        }
        if revents.intersects(IoEvents::ERR | IoEvents::NVAL) {
            invoke(&self.error_callback);
        }
        if revents.intersects(IoEvents::IN | IoEvents::PRI | IoEvents::RDHUP) {
            self.invoke_read(receive_time);
        }
        if revents.contains(IoEvents::OUT) {
            invoke(&self.write_callback);
        }
    }

    fn invoke_read(&self, receive_time: Timestamp) {
        let taken = self.read_callback.borrow_mut().take();
        if let Some(mut callback) = taken {
            callback(receive_time);
            // Keep a replacement the callback may have installed.
            let mut slot = self.read_callback.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }

    pub fn enable_reading(&self) {
        self.events.set(self.events.get() | IoEvents::READ);
        self.update();
    }

    pub fn disable_reading(&self) {
        let mut events = self.events.get();
        events.remove(IoEvents::READ);
        self.events.set(events);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.events.set(self.events.get() | IoEvents::WRITE);
        self.update();
    }

    pub fn disable_writing(&self) {
        let mut events = self.events.get();
        events.remove(IoEvents::WRITE);
        self.events.set(events);
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.set(IoEvents::empty());
        self.update();
    }

    pub fn is_none_event(&self) -> bool {
        self.events.get().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.events.get().intersects(IoEvents::READ)
    }

    pub fn is_writing(&self) -> bool {
        self.events.get().intersects(IoEvents::WRITE)
    }

    /// Deregisters the channel from the owning loop's poller.
    ///
    /// Interest must already be disabled. Must be called before the
    /// channel is dropped if it was ever registered.
    pub fn remove(&self) {
        debug_assert!(self.is_none_event());
        // Deregistration is moot once the loop and its poller are gone,
        // but the bookkeeping must still record the removal.
        self.added_to_loop.set(false);
        let event_loop = match self.event_loop.upgrade() {
            Some(event_loop) => event_loop,
            None => return,
        };
        event_loop.remove_channel(&self.self_rc());
    }

    fn update(&self) {
        let event_loop = match self.event_loop.upgrade() {
            Some(event_loop) => event_loop,
            None => return,
        };
        let this = self.self_rc();
        self.added_to_loop.set(true);
        event_loop.update_channel(&this);
    }

    fn self_rc(&self) -> Rc<Channel> {
        self.weak_self
            .upgrade()
            .expect("a channel is always held inside Rc")
    }

    // Loop teardown path: the loop's own weak reference is already dead
    // while it runs its destructor, so it clears the bookkeeping here and
    // talks to the poller directly.
    pub(crate) fn detach(&self) {
        self.events.set(IoEvents::empty());
        self.added_to_loop.set(false);
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> IoEvents {
        self.events.get()
    }

    pub fn revents(&self) -> IoEvents {
        self.revents.get()
    }

    /// Records the events the poller reported for the current cycle.
    pub fn set_revents(&self, revents: IoEvents) {
        self.revents.set(revents);
    }

    /// The backend bookkeeping slot. Only the poller interprets it.
    pub fn index(&self) -> i32 {
        self.index.get()
    }

    pub fn set_index(&self, index: i32) {
        self.index.set(index);
    }

    /// The loop this channel belongs to, while it is still alive.
    pub fn owner_loop(&self) -> Option<Rc<EventLoop>> {
        self.event_loop.upgrade()
    }

    pub fn events_to_string(&self) -> String {
        format!("{:?}", self.events.get())
    }

    pub fn revents_to_string(&self) -> String {
        format!("{:?}", self.revents.get())
    }
}

fn invoke(slot: &RefCell<Option<EventCallback>>) {
    let taken = slot.borrow_mut().take();
    if let Some(mut callback) = taken {
        callback();
        let mut restored = slot.borrow_mut();
        if restored.is_none() {
            *restored = Some(callback);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(
            !self.added_to_loop.get(),
            "channel fd={} dropped while still registered",
            self.fd
        );
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events.get())
            .field("revents", &self.revents.get())
            .field("index", &self.index.get())
            .finish()
    }
}
