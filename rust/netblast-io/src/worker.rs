//! Per-ring worker threads
//!
//! When a worker owns a ring, the main thread never touches it again
//! until teardown hands it back. RX workers run the dispatcher in an
//! uncoordinated loop with their own clock reads; TX workers drive the
//! scheduler from a thread-local timer root. The only cross-thread
//! signal is the `active` flag, released on store and acquired on load.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use netblast_timer::{Timestamp, TimerRoot};

use crate::dispatch::PacketSink;
use crate::rx::RxIo;
use crate::tx::TxIo;

/// Sleep after an iteration that moved nothing.
const IDLE_SLEEP: Duration = Duration::from_micros(100);
/// Sleep after a productive iteration; yields the CPU without losing the
/// ring.
const BUSY_SLEEP: Duration = Duration::from_micros(1);
/// Upper bound on any worker sleep so teardown is observed promptly.
const MAX_SLEEP: Duration = Duration::from_millis(10);

pub struct RxWorker {
    active: Arc<AtomicBool>,
    handle: JoinHandle<RxIo>,
}

impl RxWorker {
    pub fn spawn(mut rx: RxIo, sink: Arc<dyn PacketSink>) -> std::io::Result<Self> {
        let active = Arc::new(AtomicBool::new(true));
        let thread_active = active.clone();
        let name = format!("nb-rx-{}", rx.iface());
        let handle = std::thread::Builder::new().name(name).spawn(move || {
            while thread_active.load(Ordering::Acquire) {
                let processed = rx.run(&*sink, Timestamp::now());
                let sleep = if processed == 0 { IDLE_SLEEP } else { BUSY_SLEEP };
                std::thread::sleep(sleep);
            }
            rx
        })?;
        Ok(RxWorker { active, handle })
    }

    /// Signal and join; the worker exits within one sleep period and the
    /// ring comes back for teardown.
    pub fn stop(self) -> RxIo {
        self.active.store(false, Ordering::Release);
        self.handle.join().expect("rx worker panicked")
    }
}

pub struct TxWorker {
    active: Arc<AtomicBool>,
    handle: JoinHandle<TxIo>,
}

impl TxWorker {
    pub fn spawn(tx: TxIo, interval: Duration) -> std::io::Result<Self> {
        let active = Arc::new(AtomicBool::new(true));
        let thread_active = active.clone();
        let name = format!("nb-tx-{}", tx.iface());
        let handle = std::thread::Builder::new().name(name).spawn(move || {
            // Thread-local wheel: timers are never mutated across
            // threads.
            let tx = Rc::new(RefCell::new(tx));
            let mut root = TimerRoot::new();
            let job = tx.clone();
            root.add_periodic("tx (threaded)", Duration::ZERO, interval, move |ts| {
                job.borrow_mut().run(ts);
            });
            while thread_active.load(Ordering::Acquire) {
                let sleep = root.tick();
                std::thread::sleep(sleep.min(MAX_SLEEP));
            }
            drop(root);
            Rc::try_unwrap(tx)
                .ok()
                .expect("tx job closure released with the timer root")
                .into_inner()
        })?;
        Ok(TxWorker { active, handle })
    }

    pub fn stop(self) -> TxIo {
        self.active.store(false, Ordering::Release);
        self.handle.join().expect("tx worker panicked")
    }
}
