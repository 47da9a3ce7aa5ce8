//! Generic optimization control loop.
//!
//! An [`Optimizer`] binds one [`Strategy`] to a backend, a judge and a
//! [`Session`], and drives it step by step:
//!
//! ```text
//! for each step up to max_steps:
//!     stop flag set          -> Stopped
//!     strategy.step()
//!     publish the StepResult (callback + event channel)
//!     result.should_stop     -> Completed
//!     result.error           -> Failed (Stopped if the stop flag is set)
//!     best score >= target   -> Completed
//! budget exhausted           -> Completed
//! ```
//!
//! Errors and panics raised by a step are caught here and turn the run
//! into `Failed`; they never reach the caller's thread.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::candidate::{Candidate, EngineKind};
use crate::client::{ExecutionError, InferenceBackend, InferenceResult, Message, StopFlag};
use crate::judge::{evaluate_bench, CaseEvaluation, Evaluator};
use crate::session::{Phase, Session};

/// Event buffer of a background run. The producer blocks while it is full,
/// so a reader that falls behind slows the run instead of losing events.
pub const EVENT_BUFFER: usize = 64;

/// Lifecycle of a run. `Paused` is part of the vocabulary but the built-in
/// loop never enters it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl OptimizerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OptimizerStatus::Completed | OptimizerStatus::Failed | OptimizerStatus::Stopped
        )
    }
}

impl fmt::Display for OptimizerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerStatus::Idle => "idle",
            OptimizerStatus::Running => "running",
            OptimizerStatus::Paused => "paused",
            OptimizerStatus::Completed => "completed",
            OptimizerStatus::Failed => "failed",
            OptimizerStatus::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// What one strategy step produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub candidates: Vec<Candidate>,
    pub best_candidate: Option<Candidate>,
    pub step_number: u32,
    pub phase: Phase,
    pub active_node: String,
    pub narration: String,
    pub should_stop: bool,
    pub error: Option<String>,
}

impl StepResult {
    /// Result for the session's current step, best candidate picked from
    /// `candidates` (earliest wins ties).
    pub fn new(session: &Session, candidates: Vec<Candidate>, should_stop: bool) -> Self {
        let best_candidate = best_of(&candidates).cloned();
        StepResult {
            candidates,
            best_candidate,
            step_number: session.current_step,
            phase: session.phase,
            active_node: session.active_node.clone(),
            narration: session.narration.clone(),
            should_stop,
            error: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

/// Highest aggregate score; earliest wins ties.
pub fn best_of(candidates: &[Candidate]) -> Option<&Candidate> {
    let mut best: Option<&Candidate> = None;
    for candidate in candidates {
        match best {
            Some(b) if candidate.aggregate_score() <= b.aggregate_score() => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Point-in-time view of a run for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub engine: EngineKind,
    pub status: OptimizerStatus,
    pub step: u32,
    pub best_score: f64,
    pub candidates: usize,
    pub phase: Phase,
    pub active_node: String,
    pub narration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Collaborators a strategy may use during one step.
pub struct StepContext<'a> {
    pub backend: &'a dyn InferenceBackend,
    pub judge: &'a dyn Evaluator,
    pub stop: &'a StopFlag,
}

impl<'a> StepContext<'a> {
    pub fn new(backend: &'a dyn InferenceBackend, judge: &'a dyn Evaluator, stop: &'a StopFlag) -> Self {
        StepContext { backend, judge, stop }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_set()
    }

    /// One backend call with the default attempt budget.
    pub fn call(&self, conversation: &[Message], temperature: Option<f64>) -> InferenceResult {
        self.backend.complete(conversation, temperature)
    }

    /// Run `prompt` as the system message against one user input.
    pub fn execute_prompt(
        &self,
        prompt: &str,
        input: &str,
        temperature: f64,
    ) -> Result<String, ExecutionError> {
        let conversation = [Message::system(prompt), Message::user(input)];
        self.call(&conversation, Some(temperature)).into_content()
    }

    /// Execute and judge `prompt` on every non-empty bench case.
    pub fn evaluate_on_bench(&self, prompt: &str, session: &Session) -> Vec<CaseEvaluation> {
        let temperature = session.config.temperature;
        evaluate_bench(self.judge, prompt, &session.test_bench, |p, input| {
            self.execute_prompt(p, input, temperature)
        })
    }

    /// Evaluate `candidate.full_text` on the bench and record every case.
    pub fn score_candidate(&self, candidate: &mut Candidate, session: &Session) {
        for evaluation in self.evaluate_on_bench(&candidate.full_text, session) {
            evaluation.record_on(candidate);
        }
    }
}

/// One optimization algorithm. The loop owns the step counter: it is
/// incremented on the session before each call to [`Strategy::step`].
pub trait Strategy: Send {
    fn kind(&self) -> EngineKind;

    fn step(&mut self, ctx: &StepContext<'_>, session: &mut Session) -> anyhow::Result<StepResult>;

    /// Drop internal state so the next run starts fresh.
    fn reset(&mut self) {}
}

pub type StepCallback = Box<dyn FnMut(&StepResult) + Send>;
pub type StatusCallback = Box<dyn FnMut(OptimizerStatus) + Send>;

/// Messages from a background run, in production order.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Step(StepResult),
    Status(OptimizerStatus),
}

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("optimizer thread panicked outside the step boundary")]
    ThreadPanicked,
}

/// Cloneable handle for stopping a run from another thread.
#[derive(Clone)]
pub struct StopHandle {
    flag: StopFlag,
    backend: Arc<dyn InferenceBackend>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.flag.request();
        self.backend.request_stop();
    }

    pub fn is_requested(&self) -> bool {
        self.flag.is_set()
    }
}

/// A run on its own thread.
pub struct RunHandle {
    events: Receiver<RunEvent>,
    stop: StopHandle,
    thread: JoinHandle<Optimizer>,
}

impl RunHandle {
    /// Events end when the run finishes. Read them while the run is live:
    /// once the buffer is full the run waits for the reader.
    pub fn events(&self) -> &Receiver<RunEvent> {
        &self.events
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the run and take the optimizer (and its session) back.
    /// Unread events are discarded so a full buffer cannot stall the run.
    pub fn join(self) -> Result<Optimizer, OptimizerError> {
        let RunHandle { events, thread, .. } = self;
        drop(events);
        thread.join().map_err(|_| OptimizerError::ThreadPanicked)
    }
}

pub struct Optimizer {
    strategy: Box<dyn Strategy>,
    session: Session,
    backend: Arc<dyn InferenceBackend>,
    judge: Arc<dyn Evaluator>,
    stop: StopFlag,
    status: OptimizerStatus,
    last_error: Option<String>,
    on_step_complete: Option<StepCallback>,
    on_status_change: Option<StatusCallback>,
    events: Option<SyncSender<RunEvent>>,
    /// Candidate ids whose override came from the judge's store.
    judge_overrides: HashSet<String>,
}

impl Optimizer {
    pub fn new(
        strategy: Box<dyn Strategy>,
        mut session: Session,
        backend: Arc<dyn InferenceBackend>,
        judge: Arc<dyn Evaluator>,
    ) -> Self {
        session.metadata.engine_used = Some(strategy.kind());
        Optimizer {
            strategy,
            session,
            backend,
            judge,
            stop: StopFlag::new(),
            status: OptimizerStatus::Idle,
            last_error: None,
            on_step_complete: None,
            on_status_change: None,
            events: None,
            judge_overrides: HashSet::new(),
        }
    }

    pub fn engine(&self) -> EngineKind {
        self.strategy.kind()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    pub fn status(&self) -> OptimizerStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn current_status(&self) -> StatusSnapshot {
        StatusSnapshot {
            engine: self.strategy.kind(),
            status: self.status,
            step: self.session.current_step,
            best_score: self.session.best_score(),
            candidates: self.session.candidates().len(),
            phase: self.session.phase,
            active_node: self.session.active_node.clone(),
            narration: self.session.narration.clone(),
            last_error: self.last_error.clone(),
        }
    }

    pub fn set_callbacks(
        &mut self,
        on_step_complete: Option<StepCallback>,
        on_status_change: Option<StatusCallback>,
    ) {
        self.on_step_complete = on_step_complete;
        self.on_status_change = on_status_change;
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop.clone(),
            backend: self.backend.clone(),
        }
    }

    /// Ask the run to stop at its next checkpoint and cancel the backend's
    /// pending retries. Calling it again has no further effect.
    pub fn request_stop(&self) {
        self.stop_handle().request_stop();
    }

    /// Clear results and the stop flag and return to `Idle`.
    pub fn reset(&mut self) {
        self.stop.clear();
        self.backend.reset_stop();
        self.session.reset();
        self.strategy.reset();
        self.last_error = None;
        self.judge_overrides.clear();
        self.transition(OptimizerStatus::Idle);
    }

    /// Run on the calling thread until a terminal condition.
    pub fn run(&mut self, max_steps: u32) -> Vec<StepResult> {
        self.last_error = None;
        self.transition(OptimizerStatus::Running);
        info!(engine = %self.strategy.kind(), max_steps, "optimization started");

        let threshold = self.session.config.stop_score_threshold;
        let mut results = Vec::new();
        let mut outcome = None;

        for _ in 0..max_steps {
            if self.stop.is_set() {
                info!(step = self.session.current_step, "stop requested, ending run");
                outcome = Some(OptimizerStatus::Stopped);
                break;
            }

            self.session.current_step += 1;
            let result = match self.run_step() {
                Ok(result) => result,
                Err(message) => {
                    self.session.set_phase(Phase::Idle, "");
                    outcome = Some(if self.stop.is_set() {
                        info!(step = self.session.current_step, error = %message, "step cancelled");
                        OptimizerStatus::Stopped
                    } else {
                        error!(step = self.session.current_step, error = %message, "step failed");
                        self.last_error = Some(message);
                        OptimizerStatus::Failed
                    });
                    break;
                }
            };

            self.apply_overrides();
            let should_stop = result.should_stop;
            let step_error = result.error.clone();
            self.publish_step(&result);
            results.push(result);

            if should_stop {
                debug!(step = self.session.current_step, "strategy requested stop");
                if let Some(message) = step_error {
                    self.last_error = Some(message);
                }
                outcome = Some(OptimizerStatus::Completed);
                break;
            }
            if let Some(message) = step_error {
                // Errors caused by a cancelled backend call end the run as Stopped.
                if self.stop.is_set() {
                    info!(step = self.session.current_step, "stop requested during step");
                    outcome = Some(OptimizerStatus::Stopped);
                } else {
                    warn!(step = self.session.current_step, error = %message, "step reported an error");
                    self.last_error = Some(message);
                    outcome = Some(OptimizerStatus::Failed);
                }
                break;
            }
            let best = self.session.best_score();
            if best >= threshold {
                info!(best_score = best, threshold, "target score reached");
                outcome = Some(OptimizerStatus::Completed);
                break;
            }
        }

        let outcome = outcome.unwrap_or(if self.stop.is_set() {
            OptimizerStatus::Stopped
        } else {
            OptimizerStatus::Completed
        });
        self.transition(outcome);
        info!(
            status = %outcome,
            steps = results.len(),
            best_score = self.session.best_score(),
            "optimization finished"
        );
        results
    }

    /// Run the same loop on a dedicated thread.
    pub fn run_async(mut self, max_steps: u32) -> RunHandle {
        let capacity = (max_steps as usize).min(EVENT_BUFFER) + 2;
        let (tx, rx) = sync_channel(capacity);
        self.events = Some(tx);
        let stop = self.stop_handle();

        let thread = thread::spawn(move || {
            self.run(max_steps);
            self.events = None;
            self
        });

        RunHandle {
            events: rx,
            stop,
            thread,
        }
    }

    fn run_step(&mut self) -> Result<StepResult, String> {
        let ctx = StepContext::new(self.backend.as_ref(), self.judge.as_ref(), &self.stop);
        let strategy = &mut self.strategy;
        let session = &mut self.session;

        match catch_unwind(AssertUnwindSafe(|| strategy.step(&ctx, session))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(format!("{:#}", err)),
            Err(payload) => Err(format!("step panicked: {}", panic_message(payload.as_ref()))),
        }
    }

    /// Mirror the judge's override store onto the session. Overrides the
    /// judge no longer holds are cleared; ones set directly on the session
    /// are left alone.
    fn apply_overrides(&mut self) {
        let stored = self.judge.overrides();
        let live: HashSet<&str> = stored.iter().map(|(id, _)| id.as_str()).collect();

        let withdrawn: Vec<String> = self
            .judge_overrides
            .iter()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        for id in withdrawn {
            self.judge_overrides.remove(&id);
            match self.session.clear_override(&id) {
                Ok(()) => debug!(candidate = %id, "human override withdrawn"),
                Err(err) => warn!(candidate = %id, error = %err, "could not clear human override"),
            }
        }

        for (id, over) in stored {
            if !self.session.contains(&id) {
                continue;
            }
            match self.session.override_score(&id, over.score, over.reasoning) {
                Ok(()) => {
                    self.judge_overrides.insert(id);
                }
                Err(err) => warn!(candidate = %id, error = %err, "could not apply human override"),
            }
        }
    }

    fn publish_step(&mut self, result: &StepResult) {
        if let Some(cb) = self.on_step_complete.as_mut() {
            cb(result);
        }
        self.send_event(RunEvent::Step(result.clone()));
    }

    fn transition(&mut self, to: OptimizerStatus) {
        if self.status == to {
            return;
        }
        debug!(from = %self.status, to = %to, "status change");
        self.status = to;
        if let Some(cb) = self.on_status_change.as_mut() {
            cb(to);
        }
        self.send_event(RunEvent::Status(to));
    }

    fn send_event(&mut self, event: RunEvent) {
        if let Some(tx) = self.events.as_ref() {
            if tx.send(event).is_err() {
                debug!("event receiver gone, no further events");
                self.events = None;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{CaseDetail, CaseId};
    use crate::judge::LlmJudge;
    use crate::test_helpers::{sample_session, ScriptedBackend};
    use parking_lot::Mutex;

    /// Emits one candidate per step with a fixed score sequence.
    struct Fixed {
        scores: Vec<f64>,
        stop_at: Option<u32>,
        error_at: Option<u32>,
        panic_at: Option<u32>,
    }

    impl Fixed {
        fn new(scores: &[f64]) -> Self {
            Fixed {
                scores: scores.to_vec(),
                stop_at: None,
                error_at: None,
                panic_at: None,
            }
        }
    }

    impl Strategy for Fixed {
        fn kind(&self) -> EngineKind {
            EngineKind::Iterative
        }

        fn step(&mut self, _ctx: &StepContext<'_>, session: &mut Session) -> anyhow::Result<StepResult> {
            let step = session.current_step;
            if self.panic_at == Some(step) {
                panic!("boom at {}", step);
            }
            if self.error_at == Some(step) {
                anyhow::bail!("backend exploded");
            }
            let score = self.scores.get(step as usize - 1).copied().unwrap_or(0.0);
            let mut c = Candidate::new(EngineKind::Iterative, step, format!("prompt {}", step));
            c.record_case(CaseId::GoldenPath, score, CaseDetail::default());
            session.push_candidate(c.clone())?;
            session.record_step_best(step, &c)?;
            Ok(StepResult::new(session, vec![c], self.stop_at == Some(step)))
        }
    }

    fn optimizer(strategy: Fixed) -> Optimizer {
        let backend = Arc::new(ScriptedBackend::new());
        let judge = Arc::new(LlmJudge::new(backend.clone()));
        Optimizer::new(Box::new(strategy), sample_session(), backend, judge)
    }

    fn record_statuses(opt: &mut Optimizer) -> Arc<Mutex<Vec<OptimizerStatus>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        opt.set_callbacks(None, Some(Box::new(move |s| sink.lock().push(s))));
        seen
    }

    #[test]
    fn exhausting_budget_completes() {
        let mut opt = optimizer(Fixed::new(&[10.0, 20.0, 30.0]));
        let statuses = record_statuses(&mut opt);
        let results = opt.run(3);
        assert_eq!(results.len(), 3);
        assert_eq!(opt.status(), OptimizerStatus::Completed);
        assert_eq!(
            *statuses.lock(),
            vec![OptimizerStatus::Running, OptimizerStatus::Completed]
        );
        let steps: Vec<u32> = results.iter().map(|r| r.step_number).collect();
        assert_eq!(steps, vec![1, 2, 3]);
        let traj: Vec<u32> = opt.session().trajectory().iter().map(|e| e.step).collect();
        assert_eq!(traj, steps);
    }

    #[test]
    fn threshold_ends_run() {
        let mut opt = optimizer(Fixed::new(&[50.0, 96.0, 10.0]));
        let results = opt.run(10);
        assert_eq!(results.len(), 2);
        assert_eq!(opt.status(), OptimizerStatus::Completed);
    }

    #[test]
    fn should_stop_ends_run() {
        let mut strategy = Fixed::new(&[1.0, 2.0, 3.0, 4.0]);
        strategy.stop_at = Some(2);
        let mut opt = optimizer(strategy);
        assert_eq!(opt.run(10).len(), 2);
        assert_eq!(opt.status(), OptimizerStatus::Completed);
    }

    #[test]
    fn step_error_fails_without_raising() {
        let mut strategy = Fixed::new(&[1.0, 2.0]);
        strategy.error_at = Some(2);
        let mut opt = optimizer(strategy);
        let results = opt.run(5);
        assert_eq!(results.len(), 1);
        assert_eq!(opt.status(), OptimizerStatus::Failed);
        assert_eq!(opt.last_error(), Some("backend exploded"));
    }

    #[test]
    fn panic_in_step_is_contained() {
        let mut strategy = Fixed::new(&[1.0]);
        strategy.panic_at = Some(1);
        let mut opt = optimizer(strategy);
        let results = opt.run(5);
        assert!(results.is_empty());
        assert_eq!(opt.status(), OptimizerStatus::Failed);
        assert!(opt.last_error().unwrap().contains("boom at 1"));
    }

    #[test]
    fn stop_before_run_stops_immediately() {
        let mut opt = optimizer(Fixed::new(&[1.0]));
        let statuses = record_statuses(&mut opt);
        opt.request_stop();
        opt.request_stop();
        assert!(opt.run(5).is_empty());
        assert_eq!(opt.status(), OptimizerStatus::Stopped);
        assert_eq!(
            *statuses.lock(),
            vec![OptimizerStatus::Running, OptimizerStatus::Stopped]
        );
    }

    #[test]
    fn reset_after_stop_returns_to_idle() {
        let mut opt = optimizer(Fixed::new(&[1.0, 2.0]));
        opt.run(2);
        opt.request_stop();
        opt.run(2);
        assert_eq!(opt.status(), OptimizerStatus::Stopped);

        let statuses = record_statuses(&mut opt);
        opt.reset();
        assert_eq!(opt.status(), OptimizerStatus::Idle);
        assert!(opt.session().candidates().is_empty());
        assert!(opt.session().trajectory().is_empty());
        assert_eq!(*statuses.lock(), vec![OptimizerStatus::Idle]);

        // Reusable after reset.
        assert_eq!(opt.run(2).len(), 2);
    }

    #[test]
    fn step_callback_sees_every_result() {
        let mut opt = optimizer(Fixed::new(&[1.0, 2.0, 3.0]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        opt.set_callbacks(Some(Box::new(move |r: &StepResult| sink.lock().push(r.step_number))), None);
        opt.run(3);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn snapshot_reports_progress() {
        let mut opt = optimizer(Fixed::new(&[40.0, 60.0]));
        opt.run(2);
        let snap = opt.current_status();
        assert_eq!(snap.engine, EngineKind::Iterative);
        assert_eq!(snap.step, 2);
        assert_eq!(snap.candidates, 2);
        assert_eq!(snap.best_score, 60.0);
        assert_eq!(snap.status, OptimizerStatus::Completed);
    }

    #[test]
    fn unbounded_budget_runs_in_background() {
        let mut strategy = Fixed::new(&[30.0]);
        strategy.stop_at = Some(1);
        let handle = optimizer(strategy).run_async(u32::MAX);
        let events: Vec<RunEvent> = handle.events().iter().collect();
        let steps = events.iter().filter(|e| matches!(e, RunEvent::Step(_))).count();
        assert_eq!(steps, 1);

        let opt = handle.join().unwrap();
        assert_eq!(opt.status(), OptimizerStatus::Completed);
        assert_eq!(opt.session().current_step, 1);
    }

    #[test]
    fn join_without_reading_events_does_not_stall() {
        let handle = optimizer(Fixed::new(&[])).run_async(100);
        let opt = handle.join().unwrap();
        assert_eq!(opt.status(), OptimizerStatus::Completed);
        assert_eq!(opt.session().current_step, 100);
        assert_eq!(opt.session().trajectory().len(), 100);
    }

    #[test]
    fn slow_reader_still_sees_every_step() {
        let handle = optimizer(Fixed::new(&[])).run_async(EVENT_BUFFER as u32 * 2);
        thread::sleep(std::time::Duration::from_millis(50));
        let steps = handle
            .events()
            .iter()
            .filter(|e| matches!(e, RunEvent::Step(_)))
            .count();
        assert_eq!(steps, EVENT_BUFFER * 2);
        assert_eq!(handle.join().unwrap().status(), OptimizerStatus::Completed);
    }

    #[test]
    fn best_of_prefers_first_on_tie() {
        let a = Candidate::new(EngineKind::Iterative, 1, "a");
        let b = Candidate::new(EngineKind::Iterative, 1, "b");
        let list = vec![a.clone(), b];
        assert_eq!(best_of(&list).unwrap().id, a.id);
        assert!(best_of(&[]).is_none());
    }
}
