//! Frame-driven render loop core.
//!
//! The crate sits between a host that owns the frame clock and a graphics
//! backend that owns the GPU. The flow per frame is:
//!
//! ```text
//!   host clock ── delta ms ──▶ RenderDispatcher::tick
//!                                     │
//!                                     ▼
//!                      active RenderRoutine::render
//!                        │            │              │
//!                        ▼            ▼              ▼
//!              FrameAccumulator  ShaderProgram   RenderableSequence
//!              (timed advances)  (cached uniforms) (animated textures)
//!                                     │
//!                                     ▼
//!                             dyn GraphicsBackend
//! ```
//!
//! `RecordingBackend` stands in for a GPU in tests and headless runs; the
//! `wgpu` feature adds an offscreen `WgpuBackend`. Everything here is driven
//! from a single render thread; [`UniformRemote`] is the only handle meant to
//! cross threads.

pub mod accumulator;
pub mod backend;
pub mod dispatcher;
pub mod drift;
pub mod error;
#[cfg(feature = "wgpu")]
pub mod gpu;
pub mod headless;
pub mod program;
mod remote;
pub mod sequence;
pub mod uniforms;

pub use accumulator::FrameAccumulator;
pub use backend::{
    BackendError, GraphicsBackend, ProgramHandle, ResourceRegistry, TextureHandle, Viewport,
};
pub use dispatcher::{
    DispatchStats, FailureContext, FailureDisposition, FailureReport, LifecycleStage,
    RenderDispatcher, RenderRoutine, RoutineHandle, RoutineId, RoutineState, TickOutcome,
};
pub use drift::{Drift, DriftConfig, DriftPhase, DriftSet};
pub use error::{RenderError, Result};
pub use headless::{CallCounts, RecordingBackend};
pub use program::{ActiveProgram, ShaderProgram, ShaderSource, UniformDeclaration};
pub use remote::UniformRemote;
pub use sequence::RenderableSequence;
pub use uniforms::{UniformDescriptor, UniformKind, UniformSlot, UniformValue};
