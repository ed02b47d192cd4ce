//! Threading-model properties of the event loop: loop-per-thread
//! fatality, cross-thread work injection, wakeup latency, and dispatch
//! through a real descriptor.

use std::cell::Cell;
use std::panic;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use evloop::{Channel, EventLoop, LoopHandle, LoopRegistry};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Starts a loop on its own thread and hands back its handle.
fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
    let (handle_tx, handle_rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let event_loop = EventLoop::new();
        handle_tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    (handle_rx.recv().unwrap(), join)
}

#[test]
fn second_loop_on_a_thread_is_fatal() {
    init_logging();
    let registry = Rc::new(LoopRegistry::new());
    let _first = EventLoop::new_in(Rc::clone(&registry));

    let registry_for_second = Rc::clone(&registry);
    let result = panic::catch_unwind(panic::AssertUnwindSafe(move || {
        let _second = EventLoop::new_in(registry_for_second);
    }));
    assert!(result.is_err());

    // The first loop is still the installed one.
    assert!(registry.current().is_some());
}

#[test]
fn one_loop_per_distinct_thread_succeeds() {
    init_logging();
    let threads: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                let event_loop = EventLoop::new();
                assert!(event_loop.is_in_loop_thread());
            })
        })
        .collect();
    for join in threads {
        join.join().unwrap();
    }
}

#[test]
fn run_in_loop_on_owning_thread_is_synchronous() {
    init_logging();
    let event_loop = EventLoop::new();
    let ran = Rc::new(Cell::new(0));
    let ran_in_work = Rc::clone(&ran);
    event_loop.run_in_loop(move |event_loop| {
        assert!(event_loop.is_in_loop_thread());
        ran_in_work.set(ran_in_work.get() + 1);
    });
    assert_eq!(ran.get(), 1);

    // The handle takes the same synchronous path on the owning thread.
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_in_work = Arc::clone(&counter);
    event_loop.handle().run_in_loop(move |_| {
        counter_in_work.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn handle_stays_synchronous_with_an_explicit_registry() {
    init_logging();
    let registry = Rc::new(LoopRegistry::new());
    let event_loop = EventLoop::new_in(registry);

    let counter = Arc::new(AtomicUsize::new(0));
    let counter_in_work = Arc::clone(&counter);
    event_loop.handle().run_in_loop(move |event_loop| {
        assert!(event_loop.is_in_loop_thread());
        counter_in_work.fetch_add(1, Ordering::SeqCst);
    });
    // Completed before returning, not parked in the pending queue.
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn cross_thread_work_runs_once_on_the_owning_thread() {
    init_logging();
    let (handle, join) = spawn_loop();
    assert!(!handle.is_in_loop_thread());

    let counter = Arc::new(AtomicUsize::new(0));
    let counter_in_work = Arc::clone(&counter);
    let submitter = thread::current().id();
    handle.run_in_loop(move |event_loop| {
        assert!(event_loop.is_in_loop_thread());
        assert_ne!(thread::current().id(), submitter);
        counter_in_work.fetch_add(1, Ordering::SeqCst);
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while counter.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "queued work never ran");
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    handle.quit();
    join.join().unwrap();
}

#[test]
fn wakeup_bounds_cross_thread_latency() {
    init_logging();
    let (handle, join) = spawn_loop();
    // Give the loop time to enter its ten-second wait.
    thread::sleep(Duration::from_millis(100));

    let (done_tx, done_rx) = mpsc::channel();
    let submitted = Instant::now();
    handle.queue_in_loop(move |_| {
        done_tx.send(()).unwrap();
    });
    done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("queued work should preempt the poll timeout");
    assert!(submitted.elapsed() < Duration::from_secs(2));

    handle.quit();
    join.join().unwrap();
}

#[test]
fn quit_from_foreign_thread_preempts_the_poll_timeout() {
    init_logging();
    let (handle, join) = spawn_loop();
    thread::sleep(Duration::from_millis(100));

    let requested = Instant::now();
    handle.quit();
    join.join().unwrap();
    assert!(requested.elapsed() < Duration::from_secs(2));
}

#[test]
fn work_queued_by_running_work_waits_for_the_next_cycle() {
    init_logging();
    let (handle, join) = spawn_loop();

    let outer_finished = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel();
    let outer_finished_in_outer = Arc::clone(&outer_finished);
    handle.queue_in_loop(move |event_loop| {
        let first_cycle = event_loop.poll_return_time();
        let outer_finished = Arc::clone(&outer_finished_in_outer);
        event_loop.queue_in_loop(move |event_loop| {
            // Deferred past the drain pass that ran the outer item.
            assert!(outer_finished.load(Ordering::SeqCst));
            assert!(event_loop.poll_return_time() >= first_cycle);
            done_tx.send(()).unwrap();
        });
        outer_finished_in_outer.store(true, Ordering::SeqCst);
    });

    // The inner item still runs promptly: queueing during the drain pass
    // requests a wakeup, so the next cycle is not a full timeout away.
    done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("deferred work should run in the next cycle");

    handle.quit();
    join.join().unwrap();
}

#[test]
fn channel_dispatches_read_readiness_from_a_live_descriptor() {
    init_logging();
    let (result_tx, result_rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let event_loop = EventLoop::new();

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let channel = Channel::new(&event_loop, read_fd);
        let handle = event_loop.handle();
        channel.set_read_callback(move |receive_time| {
            let mut buf = [0u8; 16];
            let nread =
                unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            result_tx.send((nread, receive_time)).unwrap();
            handle.quit();
        });
        channel.enable_reading();

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let message = b"ping";
            let nwritten = unsafe {
                libc::write(
                    write_fd,
                    message.as_ptr() as *const libc::c_void,
                    message.len(),
                )
            };
            assert_eq!(nwritten, message.len() as isize);
        });

        event_loop.run();
        writer.join().unwrap();

        channel.disable_all();
        channel.remove();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    });

    let (nread, receive_time) = result_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("read callback should fire");
    assert_eq!(nread, 4);
    assert!(receive_time.is_valid());
    join.join().unwrap();
}
