use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::error;

use crate::event_loop::EventLoop;

/// Tracks the one event loop allowed to live on a thread.
///
/// [`EventLoop::new`] consults the calling thread's default registry.
/// Unit tests construct their own registry and hand it to
/// [`EventLoop::new_in`] so the one-loop-per-thread check can be
/// exercised in isolation.
///
/// The slot holds a weak reference: once a loop is destroyed its thread
/// may host a successor, the fatality applies to concurrent loops only.
pub struct LoopRegistry {
    slot: RefCell<Option<Weak<EventLoop>>>,
}

impl LoopRegistry {
    pub fn new() -> Self {
        Self {
            slot: RefCell::new(None),
        }
    }

    /// The loop installed in this registry, if it is still alive.
    pub fn current(&self) -> Option<Rc<EventLoop>> {
        self.slot.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn install(&self, event_loop: &Rc<EventLoop>) {
        if let Some(existing) = self.current() {
            error!(
                "another event loop already exists in thread {:?}",
                existing.thread_id()
            );
            panic!("a thread may host at most one EventLoop");
        }
        *self.slot.borrow_mut() = Some(Rc::downgrade(event_loop));
    }

    pub(crate) fn uninstall(&self, event_loop: &EventLoop) {
        let mut slot = self.slot.borrow_mut();
        let installed_self = slot
            .as_ref()
            .map_or(false, |weak| std::ptr::eq(weak.as_ptr(), event_loop));
        if installed_self {
            *slot = None;
        }
    }
}

impl Default for LoopRegistry {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static THREAD_REGISTRY: Rc<LoopRegistry> = Rc::new(LoopRegistry::new());
}

/// The calling thread's default registry.
pub fn thread_registry() -> Rc<LoopRegistry> {
    THREAD_REGISTRY.with(Rc::clone)
}

/// The event loop owned by the calling thread, if one exists.
pub fn current() -> Option<Rc<EventLoop>> {
    THREAD_REGISTRY.with(|registry| registry.current())
}
