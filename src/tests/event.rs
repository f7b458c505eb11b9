use super::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn signal_before_wait_is_not_lost() {
    let event = Event::new();
    event.signal();
    event.wait(); // returns immediately
}

#[test]
fn signal_is_sticky_until_reset() {
    let event = Event::new();
    event.signal();
    event.wait();
    event.wait(); // still signalled
    event.reset();
    event.signal();
    event.wait();
}

#[test]
fn wakes_a_blocked_waiter() {
    let event = Arc::new(Event::new());
    let waiter = {
        let event = event.clone();
        thread::spawn(move || event.wait())
    };
    thread::sleep(Duration::from_millis(10));
    event.signal();
    waiter.join().unwrap();
}

#[test]
fn wakes_all_blocked_waiters() {
    let event = Arc::new(Event::new());
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let event = event.clone();
            thread::spawn(move || event.wait())
        })
        .collect();
    thread::sleep(Duration::from_millis(10));
    event.signal();
    for waiter in waiters {
        waiter.join().unwrap();
    }
}
