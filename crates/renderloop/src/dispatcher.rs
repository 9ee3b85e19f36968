//! Per-frame driver for pluggable render routines.
//!
//! The dispatcher owns the graphics backend and holds at most one active
//! routine. Routines themselves are owned by the host through
//! [`RoutineHandle`]s; the dispatcher only tracks their lifecycle:
//!
//! ```text
//!   Unregistered ──initialize──▶ Initialized ──on_selected──▶ Selected
//!                                                   ▲            │
//!                                      on_selected  │            │ on_deselected
//!                                                   │            ▼
//!                                                  Deselected ◀──┘
//! ```
//!
//! Every lifecycle call is isolated. An error or panic is first offered to
//! the routine's `handle_failure`; if the routine does not recover, it is
//! forced to `Deselected`, a [`FailureReport`] is queued for the host and
//! the frame loop carries on without it.
//!
//! Routine handles are `Rc`-based, so a dispatcher cannot leave the thread
//! that created it.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::backend::{GraphicsBackend, ProgramHandle};

/// A unit of per-frame drawing logic.
pub trait RenderRoutine {
    fn name(&self) -> &str;

    /// Lets a routine that was set up elsewhere skip `initialize`.
    fn is_initialized(&self) -> bool {
        false
    }

    /// Called at most once per routine instance, before its first selection.
    fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> anyhow::Result<()>;

    fn on_selected(&mut self, _backend: &mut dyn GraphicsBackend) -> anyhow::Result<()> {
        Ok(())
    }

    fn render(&mut self, backend: &mut dyn GraphicsBackend, delta_millis: f64)
        -> anyhow::Result<()>;

    fn on_deselected(&mut self, _backend: &mut dyn GraphicsBackend) -> anyhow::Result<()> {
        Ok(())
    }

    /// Gives back backend resources. A released routine is initialized
    /// again on its next selection.
    fn release(&mut self, _backend: &mut dyn GraphicsBackend) {}

    /// Chance to recover from a failure in one of the lifecycle calls.
    fn handle_failure(
        &mut self,
        _error: &anyhow::Error,
        _context: &FailureContext,
    ) -> anyhow::Result<FailureDisposition> {
        Ok(FailureDisposition::Unhandled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutineId(u64);

impl fmt::Display for RoutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "routine#{}", self.0)
    }
}

static NEXT_ROUTINE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared, host-owned reference to a routine instance.
#[derive(Clone)]
pub struct RoutineHandle {
    id: RoutineId,
    name: String,
    routine: Rc<RefCell<dyn RenderRoutine>>,
}

impl RoutineHandle {
    pub fn new<R: RenderRoutine + 'static>(routine: R) -> Self {
        let name = routine.name().to_string();
        let routine: Rc<RefCell<dyn RenderRoutine>> = Rc::new(RefCell::new(routine));
        Self {
            id: RoutineId(NEXT_ROUTINE_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            routine,
        }
    }

    pub fn id(&self) -> RoutineId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn reports_initialized(&self) -> bool {
        self.routine
            .try_borrow()
            .map(|routine| routine.is_initialized())
            .unwrap_or(false)
    }
}

impl fmt::Debug for RoutineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutineHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutineState {
    Unregistered,
    Initialized,
    Selected,
    Deselected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleStage {
    Initialize,
    Select,
    Render,
    Deselect,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleStage::Initialize => f.write_str("initialize"),
            LifecycleStage::Select => f.write_str("on_selected"),
            LifecycleStage::Render => f.write_str("render"),
            LifecycleStage::Deselect => f.write_str("on_deselected"),
        }
    }
}

/// What failed, handed to [`RenderRoutine::handle_failure`].
#[derive(Clone, Debug, PartialEq)]
pub struct FailureContext {
    pub routine: String,
    pub stage: LifecycleStage,
    /// Frame delta for `render` failures.
    pub delta_millis: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureDisposition {
    Handled,
    Unhandled,
}

/// An unrecovered routine failure, kept for the host.
#[derive(Clone, Debug, PartialEq)]
pub struct FailureReport {
    pub routine: RoutineId,
    pub name: String,
    pub stage: LifecycleStage,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub frames_rendered: u64,
    pub idle_ticks: u64,
    pub failures_handled: u64,
    pub routines_evicted: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// No routine selected.
    Idle,
    Rendered,
    /// `render` failed and the routine recovered.
    Recovered,
    /// `render` failed and the routine was deselected.
    Evicted,
}

enum StageOutcome {
    Completed,
    Recovered,
    Failed(anyhow::Error),
}

pub struct RenderDispatcher<B> {
    backend: B,
    active: Option<RoutineHandle>,
    states: HashMap<RoutineId, RoutineState>,
    initialized: HashSet<RoutineId>,
    failed_initialization: HashSet<RoutineId>,
    failures: Vec<FailureReport>,
    stats: DispatchStats,
}

impl<B: GraphicsBackend> RenderDispatcher<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            active: None,
            states: HashMap::new(),
            initialized: HashSet::new(),
            failed_initialization: HashSet::new(),
            failures: Vec::new(),
            stats: DispatchStats::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn active(&self) -> Option<&RoutineHandle> {
        self.active.as_ref()
    }

    pub fn state_of(&self, routine: &RoutineHandle) -> RoutineState {
        self.states
            .get(&routine.id)
            .copied()
            .unwrap_or(RoutineState::Unregistered)
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn failures(&self) -> &[FailureReport] {
        &self.failures
    }

    /// Drains the unrecovered failures recorded so far.
    pub fn take_failures(&mut self) -> Vec<FailureReport> {
        std::mem::take(&mut self.failures)
    }

    /// Makes `routine` the active routine, deselecting the current one first.
    ///
    /// Returns whether `routine` ended up selected. A routine whose
    /// `initialize` failed without recovering is never selected again.
    pub fn select_routine(&mut self, routine: &RoutineHandle) -> bool {
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.id == routine.id)
        {
            return true;
        }
        if self.failed_initialization.contains(&routine.id) {
            warn!(
                routine = %routine.name,
                "refusing to select routine whose initialization failed"
            );
            return false;
        }

        self.deselect();

        if !self.initialized.contains(&routine.id) {
            if routine.reports_initialized() {
                debug!(routine = %routine.name, "routine reports itself initialized");
            } else {
                match self.run_stage(routine, LifecycleStage::Initialize, None) {
                    StageOutcome::Completed | StageOutcome::Recovered => {}
                    StageOutcome::Failed(error) => {
                        self.failed_initialization.insert(routine.id);
                        self.evict(routine, LifecycleStage::Initialize, error);
                        return false;
                    }
                }
            }
            self.initialized.insert(routine.id);
            self.states.insert(routine.id, RoutineState::Initialized);
        }

        match self.run_stage(routine, LifecycleStage::Select, None) {
            StageOutcome::Completed | StageOutcome::Recovered => {
                self.states.insert(routine.id, RoutineState::Selected);
                self.active = Some(routine.clone());
                info!(routine = %routine.name, id = %routine.id, "selected render routine");
                true
            }
            StageOutcome::Failed(error) => {
                self.evict(routine, LifecycleStage::Select, error);
                false
            }
        }
    }

    /// Deselects the active routine, if any.
    pub fn deselect(&mut self) {
        let Some(routine) = self.active.take() else {
            return;
        };
        match self.run_stage(&routine, LifecycleStage::Deselect, None) {
            StageOutcome::Completed | StageOutcome::Recovered => {
                self.states.insert(routine.id, RoutineState::Deselected);
                debug!(routine = %routine.name, "deselected render routine");
            }
            StageOutcome::Failed(error) => {
                self.evict(&routine, LifecycleStage::Deselect, error);
            }
        }
    }

    /// Deselects `routine` if it is active, then lets it release its
    /// resources. Its state goes back to `Unregistered`.
    pub fn release_routine(&mut self, routine: &RoutineHandle) {
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.id == routine.id)
        {
            self.deselect();
        }
        let Ok(mut target) = routine.routine.try_borrow_mut() else {
            warn!(routine = %routine.name, "routine is borrowed elsewhere; not released");
            return;
        };
        let backend: &mut dyn GraphicsBackend = &mut self.backend;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| target.release(backend))) {
            warn!(
                routine = %routine.name,
                error = %panic_message(&payload),
                "release panicked"
            );
        }
        drop(target);
        self.initialized.remove(&routine.id);
        self.states.remove(&routine.id);
        debug!(routine = %routine.name, "released render routine");
    }

    /// Renders one frame with the active routine.
    pub fn tick(&mut self, delta_millis: f64) -> TickOutcome {
        let Some(routine) = self.active.clone() else {
            self.stats.idle_ticks += 1;
            return TickOutcome::Idle;
        };

        let program_before = self.backend.active_program();
        match self.run_stage(&routine, LifecycleStage::Render, Some(delta_millis)) {
            StageOutcome::Completed => {
                self.stats.frames_rendered += 1;
                TickOutcome::Rendered
            }
            StageOutcome::Recovered => {
                self.restore_program(program_before);
                TickOutcome::Recovered
            }
            StageOutcome::Failed(error) => {
                self.restore_program(program_before);
                self.evict(&routine, LifecycleStage::Render, error);
                TickOutcome::Evicted
            }
        }
    }

    fn run_stage(
        &mut self,
        routine: &RoutineHandle,
        stage: LifecycleStage,
        delta_millis: Option<f64>,
    ) -> StageOutcome {
        let error = match invoke(routine, &mut self.backend, stage, delta_millis) {
            Ok(()) => return StageOutcome::Completed,
            Err(error) => error,
        };

        let context = FailureContext {
            routine: routine.name.clone(),
            stage,
            delta_millis,
        };
        match offer_failure(routine, &error, &context) {
            Ok(FailureDisposition::Handled) => {
                self.stats.failures_handled += 1;
                debug!(
                    routine = %routine.name,
                    %stage,
                    error = %format!("{error:#}"),
                    "routine recovered from failure"
                );
                StageOutcome::Recovered
            }
            Ok(FailureDisposition::Unhandled) => StageOutcome::Failed(error),
            Err(secondary) => {
                warn!(
                    routine = %routine.name,
                    %stage,
                    error = %format!("{secondary:#}"),
                    "failure handler itself failed"
                );
                StageOutcome::Failed(error)
            }
        }
    }

    fn evict(&mut self, routine: &RoutineHandle, stage: LifecycleStage, error: anyhow::Error) {
        if matches!(stage, LifecycleStage::Select | LifecycleStage::Render) {
            if let Err(secondary) =
                invoke(routine, &mut self.backend, LifecycleStage::Deselect, None)
            {
                debug!(
                    routine = %routine.name,
                    error = %format!("{secondary:#}"),
                    "ignoring failure during forced deselection"
                );
            }
        }
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.id == routine.id)
        {
            self.active = None;
        }
        self.states.insert(routine.id, RoutineState::Deselected);
        self.stats.routines_evicted += 1;

        let message = format!("{error:#}");
        warn!(
            routine = %routine.name,
            %stage,
            error = %message,
            "render routine failed; deselected"
        );
        self.failures.push(FailureReport {
            routine: routine.id,
            name: routine.name.clone(),
            stage,
            message,
        });
    }

    fn restore_program(&mut self, program: Option<ProgramHandle>) {
        if self.backend.active_program() == program {
            return;
        }
        if let Err(err) = self.backend.bind_program(program) {
            warn!(error = %err, "could not restore active program; unbinding");
            if let Err(err) = self.backend.bind_program(None) {
                warn!(error = %err, "could not unbind program");
            }
        }
    }
}

fn invoke(
    routine: &RoutineHandle,
    backend: &mut dyn GraphicsBackend,
    stage: LifecycleStage,
    delta_millis: Option<f64>,
) -> anyhow::Result<()> {
    let mut target = routine
        .routine
        .try_borrow_mut()
        .map_err(|_| anyhow!("routine '{}' is borrowed elsewhere", routine.name))?;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match stage {
        LifecycleStage::Initialize => target.initialize(backend),
        LifecycleStage::Select => target.on_selected(backend),
        LifecycleStage::Render => target.render(backend, delta_millis.unwrap_or(0.0)),
        LifecycleStage::Deselect => target.on_deselected(backend),
    }));
    outcome.unwrap_or_else(|payload| Err(anyhow!("{stage} panicked: {}", panic_message(&payload))))
}

fn offer_failure(
    routine: &RoutineHandle,
    error: &anyhow::Error,
    context: &FailureContext,
) -> anyhow::Result<FailureDisposition> {
    let mut target = routine
        .routine
        .try_borrow_mut()
        .map_err(|_| anyhow!("routine '{}' is borrowed elsewhere", routine.name))?;
    panic::catch_unwind(AssertUnwindSafe(|| target.handle_failure(error, context)))
        .unwrap_or_else(|payload| {
            Err(anyhow!(
                "handle_failure panicked: {}",
                panic_message(&payload)
            ))
        })
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
