//! Asynchronous signal event monitor
//!
//! A single background thread watches a set of signal registrations and runs
//! their handlers when the registered condition holds.
//!
//! Registrations arrive in a *pending* buffer under the control lock and are
//! merged into the thread's *active* set only between wait cycles, never
//! while the thread is blocked. Adding a registration fires the control's
//! wake signal so the thread merges promptly.
//!
//! # Delivery
//!
//! - Satisfied registrations run in registration order.
//! - A handler returning [`HandlerAction::StopMonitoring`] is removed and
//!   never invoked again.
//! - A handler returning [`HandlerAction::Continue`] is invoked again only
//!   after its signal is mutated and the condition holds for the new value.
//! - A panicking handler is logged and removed.
//!
//! # State machine
//!
//! ```text
//! Stopped ──start()──▶ Running ──shutdown()──▶ Stopping ──thread exit──▶ Stopped
//! ```

use crate::error::{Result, RuntimeError};
use crate::signal::{self, Signal, SignalCondition, SignalValue};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What the monitor should do with a registration after its handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    /// Keep watching the signal
    Continue,
    /// Remove the registration
    StopMonitoring,
}

/// Callback invoked with the signal value that satisfied the condition
pub type AsyncHandler = Box<dyn FnMut(SignalValue) -> HandlerAction + Send>;

/// Lifecycle state of the monitor thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Running,
    Stopping,
}

struct Registration {
    signal: Signal,
    condition: SignalCondition,
    value: SignalValue,
    handler: AsyncHandler,
    /// Signal generation at the last invocation
    fired_at: Option<u64>,
}

impl Registration {
    /// Value that should be delivered now, with the generation it belongs to
    fn due(&self) -> Option<(SignalValue, u64)> {
        let (value, generation) = self.signal.snapshot();
        (self.fired_at != Some(generation) && self.condition.is_satisfied(value, self.value))
            .then_some((value, generation))
    }

    fn is_ready(&self) -> bool {
        self.due().is_some()
    }
}

struct Control {
    state: MonitorState,
    exit: bool,
    pending: Vec<Registration>,
}

struct Shared {
    control: Mutex<Control>,
    /// Non-zero when the thread must leave its wait: new pending work or exit
    wake: Signal,
    /// Mirrors `Control::exit` for checks between handler invocations
    exiting: AtomicBool,
    active_len: AtomicUsize,
    finished: Mutex<bool>,
    finished_cv: Condvar,
    slice: Option<Duration>,
}

/// Background dispatcher for signal-driven callbacks
pub struct AsyncEventMonitor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl AsyncEventMonitor {
    /// Spawn the monitor thread.
    ///
    /// `slice` bounds each blocking wait when signals are polled;
    /// `join_timeout` bounds how long [`shutdown`](Self::shutdown) waits.
    pub fn start(slice: Option<Duration>, join_timeout: Duration) -> Result<Self> {
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                state: MonitorState::Running,
                exit: false,
                pending: Vec::new(),
            }),
            wake: Signal::new(0),
            exiting: AtomicBool::new(false),
            active_len: AtomicUsize::new(0),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
            slice,
        });

        let handle = thread::Builder::new()
            .name("hsa-async-events".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || monitor_loop(&shared)
            })
            .map_err(|e| RuntimeError::driver(format!("failed to start async event thread: {e}")))?;

        tracing::debug!("async event monitor started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
            join_timeout,
        })
    }

    /// Register `handler` to run when `signal` satisfies `condition` against
    /// `value`. Never blocks on the monitor's wait.
    pub fn set_async_signal_handler<F>(
        &self,
        signal: &Signal,
        condition: SignalCondition,
        value: SignalValue,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(SignalValue) -> HandlerAction + Send + 'static,
    {
        {
            let mut control = self.shared.control.lock();
            if control.state != MonitorState::Running {
                return Err(RuntimeError::NotInitialized);
            }
            control.pending.push(Registration {
                signal: signal.clone(),
                condition,
                value,
                handler: Box::new(handler),
                fired_at: None,
            });
        }
        self.shared.wake.store(1);
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> MonitorState {
        self.shared.control.lock().state
    }

    /// Registrations waiting to be merged
    pub fn pending_len(&self) -> usize {
        self.shared.control.lock().pending.len()
    }

    /// Registrations the thread is currently watching
    pub fn active_len(&self) -> usize {
        self.shared.active_len.load(Ordering::Acquire)
    }

    /// Stop the monitor thread.
    ///
    /// Registrations queued afterwards are rejected and pending ones are
    /// dropped. A handler already running is allowed to finish. If the thread
    /// does not exit within the join timeout it is detached.
    pub fn shutdown(&self) {
        {
            let mut control = self.shared.control.lock();
            if control.state != MonitorState::Running {
                return;
            }
            control.exit = true;
            control.state = MonitorState::Stopping;
            self.shared.exiting.store(true, Ordering::Release);
            control.pending.clear();
        }
        self.shared.wake.store(1);

        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            // Called from a handler; the loop exits once the handler returns.
            tracing::warn!("async event monitor shut down from its own thread; not joining");
            return;
        }

        let finished = {
            let mut finished = self.shared.finished.lock();
            if !*finished {
                self.shared
                    .finished_cv
                    .wait_while_for(&mut finished, |done| !*done, self.join_timeout);
            }
            *finished
        };

        if finished {
            if handle.join().is_err() {
                tracing::error!("async event thread panicked");
            }
            tracing::debug!("async event monitor stopped");
        } else {
            tracing::warn!(
                timeout_ms = self.join_timeout.as_millis() as u64,
                "async event thread did not stop in time; detaching"
            );
        }
    }
}

impl Drop for AsyncEventMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AsyncEventMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEventMonitor")
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .field("active", &self.active_len())
            .finish()
    }
}

fn monitor_loop(shared: &Shared) {
    let mut active: Vec<Registration> = Vec::new();

    loop {
        {
            let mut control = shared.control.lock();
            if control.exit {
                break;
            }
            shared.wake.store(0);
            active.append(&mut control.pending);
            shared.active_len.store(active.len(), Ordering::Release);
        }

        signal::wait_until(
            || shared.wake.load() != 0 || active.iter().any(Registration::is_ready),
            None,
            shared.slice,
        );

        if shared.control.lock().exit {
            break;
        }

        active.retain_mut(|registration| {
            if shared.exiting.load(Ordering::Acquire) {
                return true;
            }
            let Some((value, generation)) = registration.due() else {
                return true;
            };
            registration.fired_at = Some(generation);

            let handler = &mut registration.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(value))) {
                Ok(HandlerAction::Continue) => true,
                Ok(HandlerAction::StopMonitoring) => false,
                Err(_) => {
                    tracing::error!(
                        signal = registration.signal.id(),
                        "async signal handler panicked; removing registration"
                    );
                    false
                }
            }
        });
        shared.active_len.store(active.len(), Ordering::Release);
    }

    active.clear();
    shared.active_len.store(0, Ordering::Release);
    {
        let mut control = shared.control.lock();
        control.pending.clear();
        control.state = MonitorState::Stopped;
    }

    *shared.finished.lock() = true;
    shared.finished_cv.notify_all();
}
