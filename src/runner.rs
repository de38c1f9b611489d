use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::handshake::{Coordinator, Outcome};
use crate::program::{ParseError, Program};
use crate::transport::Channel;

pub const DEFAULT_JUMP_CEILING: u32 = 1_000;
const CONTROL_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopped,
    Faulted,
}

/// Why the last run faulted. Faults are never retried; the operator
/// resets or reloads before anything is dispatched again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunFault {
    #[error("device rejected command: {0}")]
    Device(String),
    #[error("no acknowledgment within the timeout")]
    AckTimeout,
    #[error("jump ceiling of {0} exceeded")]
    RunawayLoop(u32),
    #[error("transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    #[error("label N{0} does not exist")]
    InvalidTarget(u32),
    #[error("jump is only legal while paused or idle")]
    WrongState,
}

/// Outcome of one executed step, for the progress stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Acknowledged,
    /// Label-only or commandless line, nothing dispatched.
    Skipped,
    /// Jump taken to the given sequence index.
    Jumped(usize),
    DeviceError(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    State(RunState),
    /// The cursor reached this instruction (line-highlight hook).
    Reached { index: usize },
    Step { index: usize, outcome: StepOutcome },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub position: usize,
    pub state: RunState,
    pub jumps_taken: u32,
}

const IDLE_CURSOR: Cursor = Cursor {
    position: 0,
    state: RunState::Idle,
    jumps_taken: 0,
};

struct Shared {
    program: Mutex<Arc<Program>>,
    cursor: Mutex<Cursor>,
    pause: AtomicBool,
    stop: AtomicBool,
    jump_request: Mutex<Option<usize>>,
    last_fault: Mutex<Option<RunFault>>,
}

/// Cross-thread control surface. Flags set here are consulted by the
/// runner loop at the top of each iteration, never mid-round-trip.
#[derive(Clone)]
pub struct RunnerControl {
    shared: Arc<Shared>,
}

impl RunnerControl {
    /// Requests a pause at the next safe point. The in-flight command,
    /// if any, still completes its round trip first.
    pub fn pause(&self) {
        self.shared.pause.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.pause.store(false, Ordering::SeqCst);
    }

    /// Requests a stop at the next safe point. Does not auto-resume.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    pub fn cursor(&self) -> Cursor {
        *self.shared.cursor.lock().unwrap()
    }

    pub fn last_fault(&self) -> Option<RunFault> {
        self.shared.last_fault.lock().unwrap().clone()
    }

    /// Repoints the cursor at a labelled line. Only legal while paused
    /// or idle; takes effect when the runner next reaches a safe point.
    pub fn jump_to(&self, label: u32) -> Result<(), ControlError> {
        let state = self.cursor().state;
        if state != RunState::Paused && state != RunState::Idle {
            return Err(ControlError::WrongState);
        }
        let program = self.shared.program.lock().unwrap().clone();
        let target = program
            .resolve(label)
            .ok_or(ControlError::InvalidTarget(label))?;
        *self.shared.jump_request.lock().unwrap() = Some(target);
        Ok(())
    }

    /// Returns a Stopped or Faulted runner to Idle. No effect while a
    /// run is in progress.
    pub fn reset(&self) {
        let mut cursor = self.shared.cursor.lock().unwrap();
        if cursor.state == RunState::Running || cursor.state == RunState::Paused {
            return;
        }
        *cursor = IDLE_CURSOR;
        *self.shared.last_fault.lock().unwrap() = None;
        *self.shared.jump_request.lock().unwrap() = None;
        self.shared.pause.store(false, Ordering::SeqCst);
        self.shared.stop.store(false, Ordering::SeqCst);
    }
}

/// Sequential-with-jumps macro execution over one handshake coordinator.
pub struct MacroRunner<C: Channel> {
    coordinator: Coordinator<C>,
    shared: Arc<Shared>,
    events: Sender<RunnerEvent>,
    jump_ceiling: u32,
}

impl<C: Channel> MacroRunner<C> {
    pub fn new(coordinator: Coordinator<C>) -> (Self, Receiver<RunnerEvent>) {
        let (tx, rx) = channel();
        let shared = Arc::new(Shared {
            program: Mutex::new(Arc::new(Program::default())),
            cursor: Mutex::new(IDLE_CURSOR),
            pause: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            jump_request: Mutex::new(None),
            last_fault: Mutex::new(None),
        });
        let runner = Self {
            coordinator,
            shared,
            events: tx,
            jump_ceiling: DEFAULT_JUMP_CEILING,
        };
        (runner, rx)
    }

    pub fn with_jump_ceiling(mut self, ceiling: u32) -> Self {
        self.jump_ceiling = ceiling;
        self
    }

    pub fn control(&self) -> RunnerControl {
        RunnerControl {
            shared: self.shared.clone(),
        }
    }

    /// Parses and installs a macro, resetting the cursor. A reload is
    /// the explicit way out of a Stopped or Faulted run.
    pub fn load(&mut self, source: &str) -> Result<(), ParseError> {
        let program = Program::parse(source)?;
        log::info!("macro loaded: {} instructions", program.len());
        let mut cursor = self.shared.cursor.lock().unwrap();
        *self.shared.program.lock().unwrap() = Arc::new(program);
        *self.shared.jump_request.lock().unwrap() = None;
        *self.shared.last_fault.lock().unwrap() = None;
        *cursor = IDLE_CURSOR;
        Ok(())
    }

    /// Drives the loaded macro until completion, stop, or fault. Blocks
    /// the calling thread; spawn it and steer through `RunnerControl`.
    ///
    /// A Stopped or Faulted runner refuses to start again until the
    /// operator calls `RunnerControl::reset` or reloads.
    pub fn run(&mut self) -> RunState {
        {
            let cursor = self.shared.cursor.lock().unwrap();
            if cursor.state != RunState::Idle {
                log::warn!("not starting: runner is {:?}", cursor.state);
                return cursor.state;
            }
        }
        let program = self.shared.program.lock().unwrap().clone();
        if program.is_empty() {
            log::info!("macro is empty");
            return RunState::Idle;
        }

        self.shared.pause.store(false, Ordering::SeqCst);
        self.shared.stop.store(false, Ordering::SeqCst);
        *self.shared.last_fault.lock().unwrap() = None;

        // A jump_to issued while idle chooses the start position.
        let start = self
            .shared
            .jump_request
            .lock()
            .unwrap()
            .take()
            .unwrap_or(0);
        {
            let mut cursor = self.shared.cursor.lock().unwrap();
            *cursor = Cursor {
                position: start,
                state: RunState::Running,
                jumps_taken: 0,
            };
        }
        self.emit(RunnerEvent::State(RunState::Running));
        log::info!("macro started");

        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                log::info!("macro stopped");
                return self.finish(RunState::Stopped);
            }
            if self.shared.pause.load(Ordering::SeqCst) {
                self.set_state(RunState::Paused);
                self.emit(RunnerEvent::State(RunState::Paused));
                log::info!("macro paused");
                while self.shared.pause.load(Ordering::SeqCst) {
                    if self.shared.stop.load(Ordering::SeqCst) {
                        log::info!("macro stopped");
                        return self.finish(RunState::Stopped);
                    }
                    thread::sleep(CONTROL_POLL);
                }
                // A jump requested while paused lands on resume.
                if let Some(target) = self.shared.jump_request.lock().unwrap().take() {
                    self.set_position(target);
                }
                self.set_state(RunState::Running);
                self.emit(RunnerEvent::State(RunState::Running));
            }

            let position = self.position();
            if position >= program.len() {
                log::info!("macro finished");
                return self.finish(RunState::Idle);
            }
            let instr = &program.instructions()[position];
            self.emit(RunnerEvent::Reached { index: position });

            if !instr.text.is_empty() {
                match self.coordinator.dispatch(&instr.text) {
                    Ok(Outcome::Acknowledged) => {}
                    Ok(Outcome::DeviceError(message)) => {
                        self.emit(RunnerEvent::Step {
                            index: position,
                            outcome: StepOutcome::DeviceError(message.clone()),
                        });
                        return self.fault(RunFault::Device(message));
                    }
                    Ok(Outcome::TimedOut) => {
                        self.emit(RunnerEvent::Step {
                            index: position,
                            outcome: StepOutcome::TimedOut,
                        });
                        return self.fault(RunFault::AckTimeout);
                    }
                    Err(err) => return self.fault(RunFault::Transport(err.to_string())),
                }
            }

            match instr.goto_index {
                Some(target) => {
                    if self.bump_jumps() > self.jump_ceiling {
                        return self.fault(RunFault::RunawayLoop(self.jump_ceiling));
                    }
                    log::debug!("jump: line {} -> index {target}", instr.source_line);
                    self.set_position(target);
                    self.emit(RunnerEvent::Step {
                        index: position,
                        outcome: StepOutcome::Jumped(target),
                    });
                }
                None => {
                    self.set_position(position + 1);
                    let outcome = if instr.text.is_empty() {
                        StepOutcome::Skipped
                    } else {
                        StepOutcome::Acknowledged
                    };
                    self.emit(RunnerEvent::Step {
                        index: position,
                        outcome,
                    });
                }
            }
        }
    }

    fn emit(&self, event: RunnerEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn position(&self) -> usize {
        self.shared.cursor.lock().unwrap().position
    }

    fn set_position(&self, position: usize) {
        self.shared.cursor.lock().unwrap().position = position;
    }

    fn set_state(&self, state: RunState) {
        self.shared.cursor.lock().unwrap().state = state;
    }

    fn bump_jumps(&self) -> u32 {
        let mut cursor = self.shared.cursor.lock().unwrap();
        cursor.jumps_taken += 1;
        cursor.jumps_taken
    }

    fn finish(&self, state: RunState) -> RunState {
        self.set_state(state);
        self.emit(RunnerEvent::State(state));
        state
    }

    fn fault(&self, fault: RunFault) -> RunState {
        log::error!("macro faulted: {fault}");
        *self.shared.last_fault.lock().unwrap() = Some(fault);
        self.finish(RunState::Faulted)
    }
}
