use std::sync::{Arc, Mutex};

use mini_coroutine_runtime::{Coroutine, State};

fn recorder(log: &Arc<Mutex<Vec<&'static str>>>) -> impl FnOnce() + Send + 'static {
    let log = log.clone();
    move || {
        log.lock().unwrap().push("start");
        Coroutine::yield_to_ready();
        log.lock().unwrap().push("middle");
        Coroutine::yield_to_hold();
        log.lock().unwrap().push("end");
    }
}

fn drive(co: &Coroutine) -> Vec<State> {
    let mut states = Vec::new();
    while !co.state().is_terminal() {
        co.swap_in();
        states.push(co.state());
    }
    states
}

#[test]
fn reset_behaves_like_a_fresh_coroutine() {
    let fresh_log = Arc::new(Mutex::new(Vec::new()));
    let fresh = Coroutine::new(recorder(&fresh_log), 64 * 1024);
    let fresh_states = drive(&fresh);

    let reused_log = Arc::new(Mutex::new(Vec::new()));
    let reused = Coroutine::new(|| panic!("first life"), 64 * 1024);
    reused.swap_in();
    assert_eq!(reused.state(), State::Except);
    assert!(reused.failure().unwrap().contains("first life"));

    reused.reset(recorder(&reused_log));
    assert_eq!(reused.state(), State::Init);
    assert_eq!(reused.failure(), None);
    let reused_states = drive(&reused);

    assert_eq!(fresh_states, vec![State::Ready, State::Hold, State::Term]);
    assert_eq!(fresh_states, reused_states);
    assert_eq!(*fresh_log.lock().unwrap(), *reused_log.lock().unwrap());
    assert_eq!(reused.stack_size(), fresh.stack_size());
}

#[test]
fn resumed_on_another_thread() {
    let co = Coroutine::new(
        || {
            let first = std::thread::current().id();
            Coroutine::yield_to_hold();
            assert_ne!(first, std::thread::current().id());
        },
        0,
    );
    co.swap_in();
    assert_eq!(co.state(), State::Hold);

    let moved = co.clone();
    std::thread::spawn(move || moved.swap_in()).join().unwrap();
    assert_eq!(co.state(), State::Term);
}

#[test]
fn current_is_visible_inside_only() {
    assert!(Coroutine::current().is_none());
    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    let co = Coroutine::new(
        move || {
            *s.lock().unwrap() = Some(Coroutine::current_id());
        },
        0,
    );
    co.swap_in();
    assert_eq!(*seen.lock().unwrap(), Some(co.id()));
    assert!(Coroutine::current().is_none());
}
