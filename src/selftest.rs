//! Kernel-thread tests, reachable from the command line with `rtkt NAME`.
//!
//! Each test prints a begin line, PASS or FAIL lines for what it checked,
//! and an end line. Shared state lives on the launching thread's stack and
//! is handed to the children by pointer; the launcher outlives them by
//! waiting on a completion semaphore.

use arrayvec::ArrayVec;

use crate::intr::HeldInterrupts;
use crate::intr::IntrCell;
use crate::param::PRI_DEFAULT;
use crate::sync::{Lock, Semaphore};
use crate::thread::{self, Policy};
use crate::timer;

type TestFn = fn();

static TESTS: &[(&str, TestFn)] = &[
    ("alarm-single", alarm_single),
    ("alarm-multiple", alarm_multiple),
    ("priority-donate-one", priority_donate_one),
];

pub fn run(name: &str) {
    match TESTS.iter().find(|(n, _)| *n == name) {
        Some((_, f)) => {
            println!("({}) begin", name);
            f();
            println!("({}) end", name);
        }
        None => println!("rtkt: unknown test '{}'", name),
    }
}

const ALARM_THREADS: usize = 5;

struct AlarmState {
    /// Wake-up products in emission order, guarded by interrupt disabling
    /// (pushes happen right after waking, outside any lock).
    output: IntrCell<ArrayVec<u64, 64>>,
    done: Semaphore,
    iterations: u64,
}

struct AlarmThread {
    state: *const AlarmState,
    t: u64,
}

extern "C" fn alarm_thread(arg: usize) {
    let info = arg as *const AlarmThread;
    // SAFETY: the launcher keeps the state alive until every child ups
    // `done`.
    let (state, t) = unsafe { ((*info).state, (*info).t) };
    let state = unsafe { &*state };

    for i in 0..state.iterations {
        timer::sleep(((t + 1) * 10) as i64);
        let product = (i + 1) * (t + 1) * 10;
        let mut held = HeldInterrupts::new();
        let _ = state.output.borrow_mut(&mut held).try_push(product);
    }
    state.done.up();
}

/// Five threads sleep for staggered intervals; their wake-up products must
/// come out in nondecreasing order.
fn alarm_general(iterations: u64) {
    let state = AlarmState {
        output: IntrCell::new(ArrayVec::new()),
        done: Semaphore::new(0),
        iterations,
    };
    let mut infos: [AlarmThread; ALARM_THREADS] = [
        AlarmThread { state: &state, t: 0 },
        AlarmThread { state: &state, t: 1 },
        AlarmThread { state: &state, t: 2 },
        AlarmThread { state: &state, t: 3 },
        AlarmThread { state: &state, t: 4 },
    ];

    for info in infos.iter_mut() {
        let mut name = arrayvec::ArrayString::<16>::new();
        let _ = core::fmt::Write::write_fmt(&mut name, format_args!("alarm{}", info.t));
        if thread::create(&name, PRI_DEFAULT, alarm_thread, info as *mut AlarmThread as usize)
            .is_err()
        {
            println!("FAIL(thread_create)");
            return;
        }
    }
    for _ in 0..ALARM_THREADS {
        state.done.down();
    }

    let mut held = HeldInterrupts::new();
    let output = state.output.borrow_mut(&mut held);
    let sorted = output.windows(2).all(|w| w[0] <= w[1]);
    if sorted && output.len() == ALARM_THREADS * iterations as usize {
        println!("PASS");
    } else {
        println!("FAIL(out of order)");
    }
}

fn alarm_single() {
    alarm_general(1);
}

fn alarm_multiple() {
    alarm_general(7);
}

struct DonateState {
    lock: Lock,
    done: Semaphore,
}

extern "C" fn donate_acquirer(arg: usize) {
    // SAFETY: the launcher holds the state until `done` is upped.
    let state = unsafe { &*(arg as *const DonateState) };
    state.lock.acquire();
    state.lock.release();
    state.done.up();
}

/// A low-priority holder must run at its blocked acquirer's priority until
/// it releases the lock.
fn priority_donate_one() {
    if thread::current_policy() != Policy::Priority {
        println!("SKIP(needs -sched prio)");
        return;
    }

    let base = thread::current_priority();
    thread::set_priority(10);

    let state = DonateState {
        lock: Lock::new(),
        done: Semaphore::new(0),
    };
    state.lock.acquire();

    // The acquirer outranks us, runs immediately, and blocks on the lock.
    if thread::create(
        "acquirer",
        30,
        donate_acquirer,
        &state as *const DonateState as usize,
    )
    .is_err()
    {
        println!("FAIL(thread_create)");
        state.lock.release();
        thread::set_priority(base);
        return;
    }

    if thread::current_effective_priority() == 30 {
        println!("PASS(donated)");
    } else {
        println!(
            "FAIL(effective priority {} != 30)",
            thread::current_effective_priority()
        );
    }

    state.lock.release();
    state.done.down();

    if thread::current_effective_priority() == 10 {
        println!("PASS(restored)");
    } else {
        println!(
            "FAIL(effective priority {} != 10)",
            thread::current_effective_priority()
        );
    }
    thread::set_priority(base);
}
