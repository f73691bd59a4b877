//! The emulation executor.
//!
//! A dedicated thread whose only job is `while running { one frame }`.
//! Cancellation is polled once per frame; on `halt` the thread exits at
//! the frame boundary and the current instruction is finished so the CPU
//! is always left in fetch phase. `suspend`/`resume` is a counted pause
//! token: nested suspenders stack, the executor parks at the next frame
//! boundary, and mutating callers take the machine lock while it is
//! parked.
//!
//! A CPU trap (jam) stops the loop and posts `Message::Halt`; the
//! machine state stays intact for inspection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::c64::C64;
use crate::messages::{Message, MessageQueue};

struct PauseState {
    suspend_count: u32,
    /// The executor acknowledged the suspension and parked.
    parked: bool,
}

struct Shared {
    c64: Mutex<C64>,
    pause: Mutex<PauseState>,
    pause_cv: Condvar,
    cancel: AtomicBool,
    running: AtomicBool,
    trapped: AtomicBool,
}

/// Owns the machine and its executor thread.
pub struct Executor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    msgq: MessageQueue,
}

impl Executor {
    /// Wrap a machine. The executor starts halted.
    #[must_use]
    pub fn new(c64: C64) -> Self {
        let msgq = c64.message_queue();
        Self {
            shared: Arc::new(Shared {
                c64: Mutex::new(c64),
                pause: Mutex::new(PauseState {
                    suspend_count: 0,
                    parked: false,
                }),
                pause_cv: Condvar::new(),
                cancel: AtomicBool::new(false),
                running: AtomicBool::new(false),
                trapped: AtomicBool::new(false),
            }),
            thread: None,
            msgq,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Whether the last run ended in a CPU trap.
    #[must_use]
    pub fn is_trapped(&self) -> bool {
        self.shared.trapped.load(Ordering::Acquire)
    }

    /// Start (or restart) the executor thread.
    pub fn run(&mut self) {
        if self.thread.is_some() {
            return;
        }
        self.shared.cancel.store(false, Ordering::Release);
        self.shared.trapped.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        self.msgq.put(Message::Run);

        let shared = Arc::clone(&self.shared);
        let msgq = self.msgq.clone();
        self.thread = Some(
            std::thread::Builder::new()
                .name("vc64-executor".into())
                .spawn(move || executor_loop(&shared, &msgq))
                .expect("spawn executor thread"),
        );
    }

    /// Cancel the executor, join it, and leave the CPU in fetch phase.
    pub fn halt(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.shared.cancel.store(true, Ordering::Release);
            self.shared.pause_cv.notify_all();
            let _ = handle.join();
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.c64.lock().unwrap().finish_instruction();
        self.msgq.put(Message::Halt);
    }

    /// Pause the executor at the next frame boundary. Nested calls
    /// stack; the machine only resumes when every suspender released.
    pub fn suspend(&self) {
        let mut pause = self.shared.pause.lock().unwrap();
        pause.suspend_count += 1;
        // Wait for the park acknowledgement, re-checking liveness: the
        // executor may trap and exit without ever parking.
        while self.thread.is_some() && self.is_running() && !pause.parked {
            let (guard, _timeout) = self
                .shared
                .pause_cv
                .wait_timeout(pause, std::time::Duration::from_millis(10))
                .unwrap();
            pause = guard;
        }
    }

    /// Undo one `suspend`.
    pub fn resume(&self) {
        let mut pause = self.shared.pause.lock().unwrap();
        if pause.suspend_count > 0 {
            pause.suspend_count -= 1;
        }
        if pause.suspend_count == 0 {
            self.shared.pause_cv.notify_all();
        }
    }

    /// Lock the machine for inspection or mutation. Callers that need
    /// the executor out of the way wrap this in suspend/resume; quick
    /// reads may race by at most a frame.
    pub fn with_c64<T>(&self, f: impl FnOnce(&mut C64) -> T) -> T {
        let mut c64 = self.shared.c64.lock().unwrap();
        f(&mut c64)
    }

    /// Direct lock access for longer operations.
    pub fn lock(&self) -> MutexGuard<'_, C64> {
        self.shared.c64.lock().unwrap()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.shared.cancel.store(true, Ordering::Release);
            self.shared.pause_cv.notify_all();
            let _ = handle.join();
        }
    }
}

fn executor_loop(shared: &Shared, msgq: &MessageQueue) {
    loop {
        // Park while suspended; check cancellation on every wake.
        {
            let mut pause = shared.pause.lock().unwrap();
            while pause.suspend_count > 0 && !shared.cancel.load(Ordering::Acquire) {
                pause.parked = true;
                shared.pause_cv.notify_all();
                pause = shared.pause_cv.wait(pause).unwrap();
            }
            pause.parked = false;
        }

        if shared.cancel.load(Ordering::Acquire) {
            break;
        }

        let ok = {
            let mut c64 = shared.c64.lock().unwrap();
            c64.execute_one_frame()
        };

        if !ok {
            // Runtime trap: pause with state intact.
            shared.trapped.store(true, Ordering::Release);
            shared.running.store(false, Ordering::Release);
            msgq.put(Message::Halt);
            break;
        }
    }
    shared.running.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c64::tests::test_config;
    use crate::clock::ManualClock;

    fn make_executor() -> Executor {
        let mut c64 = C64::new(test_config()).unwrap();
        c64.set_clock(Box::new(ManualClock::new()));
        c64.set_always_warp(true); // no pacing in tests
        Executor::new(c64)
    }

    #[test]
    fn runs_frames_until_halted() {
        let mut executor = make_executor();
        executor.run();
        assert!(executor.is_running());
        // Wait until some frames completed.
        loop {
            let frame = executor.with_c64(|c64| c64.frame());
            if frame >= 3 {
                break;
            }
            std::thread::yield_now();
        }
        executor.halt();
        assert!(!executor.is_running());
        let in_fetch = executor.with_c64(|c64| c64.cpu.in_fetch_phase());
        assert!(in_fetch);
    }

    #[test]
    fn suspend_parks_at_frame_boundary() {
        let mut executor = make_executor();
        executor.run();
        executor.suspend();
        let frame_a = executor.with_c64(|c64| c64.frame());
        // Executor is parked: the frame number cannot move.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let frame_b = executor.with_c64(|c64| c64.frame());
        assert_eq!(frame_a, frame_b);
        executor.resume();
        loop {
            if executor.with_c64(|c64| c64.frame()) > frame_b {
                break;
            }
            std::thread::yield_now();
        }
        executor.halt();
    }

    #[test]
    fn nested_suspend_needs_matching_resumes() {
        let mut executor = make_executor();
        executor.run();
        executor.suspend();
        executor.suspend();
        executor.resume();
        let frame_a = executor.with_c64(|c64| c64.frame());
        std::thread::sleep(std::time::Duration::from_millis(10));
        let frame_b = executor.with_c64(|c64| c64.frame());
        assert_eq!(frame_a, frame_b); // still one suspender left
        executor.resume();
        loop {
            if executor.with_c64(|c64| c64.frame()) > frame_b {
                break;
            }
            std::thread::yield_now();
        }
        executor.halt();
    }

    #[test]
    fn cpu_trap_stops_the_loop() {
        let mut c64 = C64::new(test_config()).unwrap();
        c64.set_clock(Box::new(ManualClock::new()));
        c64.set_always_warp(true);
        // Jam immediately.
        c64.bus.mem.ram_write(0x2000, 0x12);
        c64.poke(0x0001, 0x34);
        c64.cpu.regs.pc = 0x2000;
        let rx = c64.message_receiver();
        let mut executor = Executor::new(c64);
        executor.run();
        loop {
            if executor.is_trapped() {
                break;
            }
            std::thread::yield_now();
        }
        assert!(!executor.is_running());
        assert!(executor.with_c64(|c64| c64.cpu.is_jammed()));
        assert!(rx.try_iter().any(|m| m == Message::Halt));
        executor.halt();
    }

    #[test]
    fn halt_without_run_is_safe() {
        let mut executor = make_executor();
        executor.halt();
        assert!(!executor.is_running());
    }
}
