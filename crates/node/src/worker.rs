//! Background thread that keeps moving the active chain toward the best candidate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use stakd_log::Category;
use stakd_storage::KeyValueStore;

use crate::context::NodeContext;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(250);
const TICK: Duration = Duration::from_secs(1);

pub struct ActivationWorker {
    wake: Sender<()>,
    shutdown: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl ActivationWorker {
    pub fn spawn<S: KeyValueStore + 'static>(context: NodeContext<S>) -> std::io::Result<Self> {
        let (wake, wake_rx) = bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let cycles = Arc::new(AtomicU64::new(0));
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_cycles = Arc::clone(&cycles);
        let handle = std::thread::Builder::new()
            .name("stakd-activate".to_string())
            .spawn(move || run(context, wake_rx, thread_shutdown, thread_cycles))?;
        Ok(Self {
            wake,
            shutdown,
            cycles,
            handle: Some(handle),
        })
    }

    /// Requests an activation attempt without waiting for the next tick.
    pub fn wake(&self) {
        let _ = self.wake.try_send(());
    }

    /// Completed activation attempts.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                stakd_log::log_error!("activation worker panicked");
            }
        }
    }
}

impl Drop for ActivationWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<S: KeyValueStore + 'static>(
    context: NodeContext<S>,
    wake: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
) {
    let mut backoff = INITIAL_BACKOFF;
    while !shutdown.load(Ordering::Acquire) {
        match context.try_activate_best_chain() {
            Ok(Some(steps)) => {
                backoff = INITIAL_BACKOFF;
                if !steps.is_empty() {
                    stakd_log::log_debug_cat!(
                        Category::Chain,
                        "background activation applied {} steps",
                        steps.len()
                    );
                }
            }
            Ok(None) => {
                // chain lock busy
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            Err(err) => stakd_log::log_error!("background activation failed: {err}"),
        }
        cycles.fetch_add(1, Ordering::AcqRel);

        match wake.recv_timeout(TICK) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
