use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use log::{debug, error, info, trace};

use crate::channel::Channel;
use crate::event_fd::EventFd;
use crate::poller::{self, Poller};
use crate::registry::{self, LoopRegistry};
use crate::timestamp::Timestamp;

/// How long a single poller wait may block, in milliseconds.
///
/// The bound guarantees that a cross-thread `quit` or a queued work item
/// is observed within one period even when no wakeup write lands.
const POLL_TIME_MS: i32 = 10_000;

/// A unit of work executed on the loop's own thread.
///
/// The loop passes itself to the work item when it runs. Loop-confined
/// objects are not `Send`, so this reference is how foreign threads
/// reach them: capture plain data, then look up or build the confined
/// state through the `&EventLoop` argument.
pub type Task = Box<dyn FnOnce(&EventLoop) + Send + 'static>;

/// A per-thread reactor loop.
///
/// Exactly one loop may live on a thread at a time; constructing a
/// second one is a fatal misuse. The loop and its channels are confined
/// to the constructing thread (the type is `!Send`); foreign threads
/// interact through a [`LoopHandle`].
pub struct EventLoop {
    shared: Arc<Shared>,
    looping: Cell<bool>,
    poller: RefCell<Box<dyn Poller>>,
    poll_return_time: Cell<Timestamp>,
    wakeup_channel: Rc<Channel>,
    registry: Rc<LoopRegistry>,
}

// The lone piece of loop state that foreign threads may touch.
struct Shared {
    thread: ThreadId,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    pending: Mutex<Vec<Task>>,
    wakeup_fd: EventFd,
    owner: OwnerSlot,
}

// Back-reference to the loop, confined to the owning thread even though
// it lives inside the `Arc`. `Weak<EventLoop>` is not `Send`, but this
// one never crosses threads: the loop writes it on its own thread and
// resets it to the allocation-free `Weak::new` in its destructor, and
// readers check `is_in_loop_thread` first.
struct OwnerSlot(RefCell<Weak<EventLoop>>);

// Safety: all reads and the upgrade happen on the owning thread only.
// After the loop's destructor runs the slot holds `Weak::new`, so a
// foreign thread dropping the last handle touches no shared refcount.
unsafe impl Send for OwnerSlot {}
unsafe impl Sync for OwnerSlot {}

impl EventLoop {
    /// Creates the event loop for the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread already hosts a loop, or if the wakeup
    /// eventfd or the poller backend cannot be created. These are
    /// configuration errors, not conditions to retry.
    pub fn new() -> Rc<Self> {
        Self::new_in(registry::thread_registry())
    }

    /// Like [`EventLoop::new`], but installs into an explicit registry
    /// instead of the calling thread's default one.
    pub fn new_in(registry: Rc<LoopRegistry>) -> Rc<Self> {
        let wakeup_fd = EventFd::new().unwrap_or_else(|err| {
            error!("failed to create wakeup eventfd: {}", err);
            panic!("failed to create wakeup eventfd: {}", err);
        });
        let backend = poller::new_default_poller().unwrap_or_else(|err| {
            error!("failed to create poller backend: {}", err);
            panic!("failed to create poller backend: {}", err);
        });

        let wakeup_raw_fd = wakeup_fd.raw_fd();
        let shared = Arc::new(Shared {
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            wakeup_fd,
            owner: OwnerSlot(RefCell::new(Weak::new())),
        });

        let event_loop = Rc::new_cyclic(|weak_self| EventLoop {
            shared,
            looping: Cell::new(false),
            poller: RefCell::new(backend),
            poll_return_time: Cell::new(Timestamp::invalid()),
            wakeup_channel: Channel::new_bound(weak_self.clone(), wakeup_raw_fd),
            registry: Rc::clone(&registry),
        });
        *event_loop.shared.owner.0.borrow_mut() = Rc::downgrade(&event_loop);
        registry.install(&event_loop);
        debug!(
            "event loop created in thread {:?}, wakeup fd {}",
            event_loop.shared.thread, wakeup_raw_fd
        );

        let shared = Arc::clone(&event_loop.shared);
        event_loop
            .wakeup_channel
            .set_read_callback(move |_receive_time| {
                if let Err(err) = shared.wakeup_fd.read_u64() {
                    error!("wakeup drain failed: {}", err);
                }
            });
        event_loop.wakeup_channel.enable_reading();
        event_loop
    }

    /// Runs the loop until [`quit`](Self::quit) takes effect. Blocks the
    /// calling thread.
    ///
    /// Each cycle waits on the poller for up to ten seconds,
    /// dispatches the ready channels in reported order with the
    /// wait-return timestamp, then drains the pending-work queue.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.looping.get(), "EventLoop::run called reentrantly");
        self.looping.set(true);
        self.shared.quit.store(false, Ordering::Release);
        info!("event loop in {:?} start looping", self.shared.thread);

        let mut active_channels: Vec<Rc<Channel>> = Vec::new();
        while !self.shared.quit.load(Ordering::Acquire) {
            active_channels.clear();
            let receive_time = self
                .poller
                .borrow_mut()
                .poll(POLL_TIME_MS, &mut active_channels);
            self.poll_return_time.set(receive_time);

            for channel in &active_channels {
                channel.handle_event(receive_time);
            }
            self.drain_pending_work();
        }

        info!("event loop in {:?} stop looping", self.shared.thread);
        self.looping.set(false);
    }

    /// Requests the loop to stop after the current cycle.
    pub fn quit(&self) {
        self.shared.quit_and_wake();
    }

    /// Runs `work` immediately.
    ///
    /// An `&EventLoop` can only exist on the owning thread, so this is
    /// always the synchronous case; the deferred cross-thread case lives
    /// on [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, work: impl FnOnce(&EventLoop)) {
        self.assert_in_loop_thread();
        work(self);
    }

    /// Appends `work` to the pending queue for execution at the end of a
    /// loop cycle, even when called from the owning thread.
    pub fn queue_in_loop(&self, work: impl FnOnce(&EventLoop) + Send + 'static) {
        self.shared.queue(Box::new(work));
    }

    /// Forces a blocked poller wait to return.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// A cloneable, `Send + Sync` handle for foreign threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Registers a new channel or refreshes a known one after an
    /// interest change. Called by [`Channel`]; channels never talk to
    /// the poller directly.
    pub fn update_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    /// Deregisters a channel from the poller.
    pub fn remove_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    /// The time the most recent poller wait returned.
    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return_time.get()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "event loop owned by {:?} touched from {:?}",
            self.shared.thread,
            thread::current().id()
        );
    }

    pub fn is_looping(&self) -> bool {
        self.looping.get()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread
    }

    // Swap under the lock, execute outside it: a work item may queue
    // more work without deadlocking on the queue lock. Items queued by a
    // running item land in the next cycle; the `calling_pending` flag
    // makes their enqueue request a wakeup so that cycle starts promptly.
    fn drain_pending_work(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let batch = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if !batch.is_empty() {
            trace!("draining {} pending work items", batch.len());
        }
        for work in batch {
            work(self);
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        trace!("event loop in {:?} destroyed", self.shared.thread);
        // The weak back-reference inside the wakeup channel is already
        // dead here, so tear it down against the poller directly.
        self.wakeup_channel.detach();
        let mut backend = self.poller.borrow_mut();
        if backend.has_channel(&self.wakeup_channel) {
            backend.remove_channel(&self.wakeup_channel);
        }
        drop(backend);
        // Leave only an allocation-free weak behind for surviving handles.
        *self.shared.owner.0.borrow_mut() = Weak::new();
        self.registry.uninstall(self);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.shared.thread)
            .field("looping", &self.looping.get())
            .finish()
    }
}

impl Shared {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    // Callers must have checked `is_in_loop_thread` already.
    fn owner_loop(&self) -> Option<Rc<EventLoop>> {
        debug_assert!(self.is_in_loop_thread());
        self.owner.0.borrow().upgrade()
    }

    fn queue(&self, work: Task) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.push(work);
        }
        // A foreign caller must interrupt the wait; an owning-thread
        // caller only needs to when the drain pass already took its
        // batch, otherwise the item runs later in this very cycle.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        if let Err(err) = self.wakeup_fd.write_u64(1) {
            error!("wakeup write failed: {}", err);
        }
    }

    fn quit_and_wake(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }
}

/// A `Send + Sync` handle to an [`EventLoop`], for use from any thread.
///
/// Handles may outlive their loop; operations on a dead loop's handle
/// are harmless no-ops at worst (the wakeup descriptor stays open until
/// the last handle drops).
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Requests the loop to stop; wakes it when called from a foreign
    /// thread so the quit flag is observed without waiting out the poll
    /// timeout.
    pub fn quit(&self) {
        self.shared.quit_and_wake();
    }

    /// Runs `work` on the loop's thread.
    ///
    /// Synchronous (completed before returning) when the caller already
    /// is the loop's thread; otherwise queued for the end of a loop
    /// cycle, at most one poll timeout away.
    pub fn run_in_loop(&self, work: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.shared.is_in_loop_thread() {
            if let Some(event_loop) = self.shared.owner_loop() {
                work(&event_loop);
                return;
            }
        }
        self.queue_in_loop(work);
    }

    /// Appends `work` to the loop's pending queue.
    ///
    /// This is the sole safe path for cross-thread access to loop-owned
    /// state: the queued closure runs on the owning thread, exactly
    /// once, strictly after the dispatch phase of a cycle.
    pub fn queue_in_loop(&self, work: impl FnOnce(&EventLoop) + Send + 'static) {
        self.shared.queue(Box::new(work));
    }

    /// Forces a blocked poller wait to return.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}
