//! Blit (DMA) engines
//!
//! Each transfer-capable agent owns one engine: a worker thread fed through a
//! channel. A command becomes eligible once every dependency signal reads
//! zero; the worker then performs the copy or fill and decrements the
//! command's completion signal exactly once.
//!
//! Commands whose dependencies are still outstanding stay parked inside the
//! worker while later eligible commands run. Eligible commands run in
//! submission order.

use crate::agent::AgentId;
use crate::error::{Result, RuntimeError};
use crate::signal::{self, Signal};
use hsa_tracing::perf_span;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Memory kinds on either side of a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl Direction {
    pub fn between(src_device: bool, dst_device: bool) -> Self {
        match (src_device, dst_device) {
            (false, false) => Direction::HostToHost,
            (false, true) => Direction::HostToDevice,
            (true, false) => Direction::DeviceToHost,
            (true, true) => Direction::DeviceToDevice,
        }
    }

    /// Short label used in transfer events
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::HostToHost => "H2H",
            Direction::HostToDevice => "H2D",
            Direction::DeviceToHost => "D2H",
            Direction::DeviceToDevice => "D2D",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Copy {
        dst: usize,
        src: usize,
        size: usize,
        direction: Direction,
    },
    Fill { dst: usize, value: u32, count: usize },
}

struct Job {
    command: Command,
    deps: Vec<Signal>,
    completion: Signal,
}

impl Job {
    fn dependencies_met(&self) -> bool {
        self.deps.iter().all(|dep| dep.load() == 0)
    }

    /// # Safety
    ///
    /// The addresses were valid for the command when it was submitted and
    /// stay valid until its completion signal is decremented.
    unsafe fn execute(&self, agent: AgentId) {
        match self.command {
            Command::Copy {
                dst,
                src,
                size,
                direction,
            } => {
                let span = perf_span!("blit_copy", agent = agent.id(), bytes = size);
                std::ptr::copy(src as *const u8, dst as *mut u8, size);
                hsa_tracing::performance::record_transfer(size, direction.as_str(), span.elapsed_us());
            }
            Command::Fill { dst, value, count } => {
                let _span = perf_span!("blit_fill", agent = agent.id(), words = count);
                std::slice::from_raw_parts_mut(dst as *mut u32, count).fill(value);
            }
        }
    }
}

/// Asynchronous copy/fill engine bound to one agent
pub struct BlitEngine {
    agent: AgentId,
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: Arc<WorkerState>,
}

/// Flags shared between an engine handle and its worker
#[derive(Default)]
struct WorkerState {
    closing: AtomicBool,
    /// Commands sent so far; the worker compares it with what it received
    submitted: AtomicU64,
}

impl BlitEngine {
    /// Start the worker thread for `agent`.
    ///
    /// `slice` bounds each dependency wait when signals are polled.
    pub(crate) fn spawn(agent: AgentId, slice: Option<Duration>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let state = Arc::new(WorkerState::default());

        let worker = thread::Builder::new()
            .name(format!("hsa-blit-{}", agent.id()))
            .spawn({
                let state = Arc::clone(&state);
                move || run_worker(agent, receiver, &state, slice)
            })
            .map_err(|e| RuntimeError::driver(format!("failed to start blit engine for {agent}: {e}")))?;

        tracing::debug!(%agent, "blit engine started");
        Ok(Self {
            agent,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            state,
        })
    }

    /// Agent driving this engine
    pub fn agent(&self) -> AgentId {
        self.agent
    }

    /// Number of commands accepted so far
    pub fn submitted(&self) -> u64 {
        self.state.submitted.load(Ordering::Acquire)
    }

    /// Queue a copy of `size` bytes from `src` to `dst`.
    ///
    /// # Safety
    ///
    /// Both ranges must stay valid until `completion` has been decremented.
    /// Overlapping ranges are copied with memmove semantics.
    pub(crate) unsafe fn submit_copy(
        &self,
        dst: *mut u8,
        src: *const u8,
        size: usize,
        direction: Direction,
        deps: &[Signal],
        completion: &Signal,
    ) -> Result<()> {
        self.submit(Job {
            command: Command::Copy {
                dst: dst as usize,
                src: src as usize,
                size,
                direction,
            },
            deps: deps.to_vec(),
            completion: completion.clone(),
        })
    }

    /// Queue a fill of `count` 32-bit words of `value` at `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be 4-byte aligned and valid for `count` words until
    /// `completion` has been decremented.
    pub(crate) unsafe fn submit_fill(
        &self,
        dst: *mut u32,
        value: u32,
        count: usize,
        deps: &[Signal],
        completion: &Signal,
    ) -> Result<()> {
        self.submit(Job {
            command: Command::Fill {
                dst: dst as usize,
                value,
                count,
            },
            deps: deps.to_vec(),
            completion: completion.clone(),
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| RuntimeError::driver(format!("blit engine for {} is stopped", self.agent)))?;
        sender
            .send(job)
            .map_err(|_| RuntimeError::driver(format!("blit engine for {} is stopped", self.agent)))?;
        self.state.submitted.fetch_add(1, Ordering::AcqRel);
        signal::notify_all();
        Ok(())
    }

    /// Stop accepting commands, run everything already eligible and join the
    /// worker. Commands still blocked on dependencies are dropped without
    /// signalling completion.
    pub(crate) fn shutdown(&self) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        self.state.closing.store(true, Ordering::Release);
        drop(sender);
        signal::notify_all();

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!(agent = %self.agent, "blit worker panicked");
            }
        }
        tracing::debug!(agent = %self.agent, "blit engine stopped");
    }
}

impl Drop for BlitEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BlitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlitEngine")
            .field("agent", &self.agent)
            .field("submitted", &self.submitted())
            .finish()
    }
}

fn run_worker(agent: AgentId, jobs: Receiver<Job>, state: &WorkerState, slice: Option<Duration>) {
    let mut parked: Vec<Job> = Vec::new();
    let mut received = 0u64;

    loop {
        let disconnected = receive_all(&jobs, &mut parked, &mut received);
        run_eligible(agent, &mut parked);
        if disconnected || state.closing.load(Ordering::Acquire) {
            break;
        }

        signal::wait_until(
            || {
                state.closing.load(Ordering::Acquire)
                    || state.submitted.load(Ordering::Acquire) > received
                    || parked.iter().any(Job::dependencies_met)
            },
            None,
            slice,
        );
    }

    receive_all(&jobs, &mut parked, &mut received);
    run_eligible(agent, &mut parked);
    if !parked.is_empty() {
        tracing::warn!(%agent, count = parked.len(), "dropping blit commands with unmet dependencies");
    }
}

/// Move every queued command into `parked`. Returns true once all senders
/// are gone.
fn receive_all(jobs: &Receiver<Job>, parked: &mut Vec<Job>, received: &mut u64) -> bool {
    loop {
        match jobs.try_recv() {
            Ok(job) => {
                *received += 1;
                parked.push(job);
            }
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => return true,
        }
    }
}

/// Run eligible commands in submission order until none is left. A command
/// may complete a signal that a parked one depends on, hence the repeat.
fn run_eligible(agent: AgentId, parked: &mut Vec<Job>) {
    loop {
        let before = parked.len();
        parked.retain(|job| {
            if !job.dependencies_met() {
                return true;
            }
            // SAFETY: guaranteed by the submit_* contracts.
            unsafe { job.execute(agent) };
            job.completion.subtract(1);
            false
        });
        if parked.len() == before {
            break;
        }
    }
}
