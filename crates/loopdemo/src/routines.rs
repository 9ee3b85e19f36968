//! Demo render routines built from `[[routines]]` entries.

use anyhow::{anyhow, Context, Result};
use glam::{EulerRot, Mat4};
use loopconfig::{DriftSettings, RoutineKind, RoutineSpec};
use renderloop::{
    DriftConfig, DriftSet, FailureContext, FailureDisposition, GraphicsBackend, LifecycleStage,
    RenderRoutine, RenderableSequence, RoutineHandle, ShaderProgram, ShaderSource, TextureHandle,
    UniformDeclaration, UniformValue,
};

const FULLSCREEN_VERTEX: &str = r#"
struct VertexOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOut {
    let corner = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: VertexOut;
    out.position = vec4<f32>(corner * 2.0 - 1.0, 0.0, 1.0);
    out.uv = vec2<f32>(corner.x, 1.0 - corner.y);
    return out;
}
"#;

const TEXTURED_FRAGMENT: &str = r#"
struct Uniforms {
    tint: vec4<f32>,
    frame: f32,
};

@group(0) @binding(0) var<uniform> uniforms: Uniforms;
@group(1) @binding(0) var frame_texture: texture_2d<f32>;
@group(1) @binding(1) var frame_sampler: sampler;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let pulse = 0.85 + 0.15 * fract(uniforms.frame * 0.25);
    return textureSample(frame_texture, frame_sampler, uv) * uniforms.tint * pulse;
}
"#;

const SPINNER_VERTEX: &str = r#"
struct Uniforms {
    transform: mat4x4<f32>,
    tint: vec4<f32>,
};

@group(0) @binding(0) var<uniform> uniforms: Uniforms;

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    var corners = array<vec2<f32>, 3>(
        vec2<f32>(0.0, 0.6),
        vec2<f32>(-0.52, -0.3),
        vec2<f32>(0.52, -0.3),
    );
    return uniforms.transform * vec4<f32>(corners[index], 0.0, 1.0);
}
"#;

const SPINNER_FRAGMENT: &str = r#"
struct Uniforms {
    transform: mat4x4<f32>,
    tint: vec4<f32>,
};

@group(0) @binding(0) var<uniform> uniforms: Uniforms;

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return uniforms.tint;
}
"#;

const FLAT_FRAGMENT: &str = r#"
struct Uniforms {
    tint: vec4<f32>,
};

@group(0) @binding(0) var<uniform> uniforms: Uniforms;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return vec4<f32>(uniforms.tint.rgb * (0.5 + 0.5 * uv.y), uniforms.tint.a);
}
"#;

/// Fallback when a faulty routine does not say when to break.
const DEFAULT_FAIL_AFTER: u64 = 60;

pub fn build_routine(
    spec: &RoutineSpec,
    drift: &DriftSettings,
    seed: u64,
) -> Result<RoutineHandle> {
    let handle = match spec.kind {
        RoutineKind::Animated => RoutineHandle::new(AnimatedRoutine::new(spec)?),
        RoutineKind::Spinner => RoutineHandle::new(SpinnerRoutine::new(&spec.name, drift, seed)?),
        RoutineKind::Faulty => RoutineHandle::new(FaultyRoutine::new(spec)),
    };
    tracing::debug!(routine = %spec.name, kind = ?spec.kind, id = %handle.id(), "built routine");
    Ok(handle)
}

fn compile(program: &mut ShaderProgram, backend: &mut dyn GraphicsBackend) -> Result<()> {
    if program.compile(backend) {
        return Ok(());
    }
    match program.last_error() {
        Some(err) => Err(anyhow!("failed to compile '{}': {err}", program.name())),
        None => Err(anyhow!("failed to compile '{}'", program.name())),
    }
}

/// Cycles solid-color textures; missing entries show the backend fallback.
pub struct AnimatedRoutine {
    name: String,
    colors: Vec<Option<[u8; 4]>>,
    frame_millis: f64,
    program: ShaderProgram,
    textures: Vec<TextureHandle>,
    sequence: Option<RenderableSequence<TextureHandle>>,
}

impl AnimatedRoutine {
    pub fn new(spec: &RoutineSpec) -> Result<Self> {
        let colors = spec.texture_colors()?;
        let source = ShaderSource::new(FULLSCREEN_VERTEX, TEXTURED_FRAGMENT)
            .with_uniform(UniformDeclaration::floats("tint", &[1.0, 1.0, 1.0, 1.0]))
            .with_uniform(UniformDeclaration::floats("frame", &[0.0]));
        Ok(Self {
            name: spec.name.clone(),
            colors,
            frame_millis: spec.frame_time.as_secs_f64() * 1000.0,
            program: ShaderProgram::new(spec.name.clone(), source),
            textures: Vec::new(),
            sequence: None,
        })
    }
}

impl RenderRoutine for AnimatedRoutine {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.sequence.is_some()
    }

    fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> Result<()> {
        let built = self.build(backend);
        if built.is_err() {
            self.release(backend);
        }
        built
    }

    fn render(&mut self, backend: &mut dyn GraphicsBackend, delta_millis: f64) -> Result<()> {
        let sequence = self
            .sequence
            .as_mut()
            .context("animated routine rendered before initialize")?;
        sequence.update(delta_millis);
        let texture = *sequence.current_resource();
        let frame = sequence.index() as f32;

        self.program.with_program(backend, |active| {
            active.bind_texture(texture, 0)?;
            active.set("frame", UniformValue::Float(vec![frame]))?;
            active.draw(3)?;
            Ok::<_, anyhow::Error>(())
        })
    }

    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        self.sequence = None;
        for texture in self.textures.drain(..) {
            backend.release_texture(texture);
        }
        self.program.destroy(backend);
    }
}

impl AnimatedRoutine {
    fn build(&mut self, backend: &mut dyn GraphicsBackend) -> Result<()> {
        compile(&mut self.program, backend)?;
        let mut entries = Vec::with_capacity(self.colors.len());
        for (index, color) in self.colors.iter().enumerate() {
            let entry = match color {
                Some(rgba) => {
                    let label = format!("{} frame {index}", self.name);
                    let texture = backend.create_texture(&label, 1, 1, rgba)?;
                    self.textures.push(texture);
                    Some(texture)
                }
                None => None,
            };
            entries.push(entry);
        }
        self.sequence = Some(RenderableSequence::new(
            entries,
            &*backend,
            self.frame_millis,
        )?);
        Ok(())
    }
}

/// A triangle whose orientation and tint drift randomly.
pub struct SpinnerRoutine {
    name: String,
    program: ShaderProgram,
    rotation: DriftSet<3>,
    color: DriftSet<3>,
}

impl SpinnerRoutine {
    pub fn new(name: &str, drift: &DriftSettings, seed: u64) -> Result<Self> {
        let step_millis = drift.step.as_secs_f64() * 1000.0;
        let rotation = DriftConfig {
            step_millis,
            resume_probability: drift.resume_probability,
            ..DriftConfig::rotation(drift.rotation_speed)
        };
        let color = DriftConfig {
            step_millis,
            resume_probability: drift.resume_probability,
            ..DriftConfig::color(drift.color_speed)
        };
        let source = ShaderSource::new(SPINNER_VERTEX, SPINNER_FRAGMENT)
            .with_uniform(UniformDeclaration::matrix("transform", 4))
            .with_uniform(UniformDeclaration::floats("tint", &[1.0, 1.0, 1.0, 1.0]));
        Ok(Self {
            name: name.to_string(),
            program: ShaderProgram::new(name, source),
            rotation: DriftSet::new(rotation, seed)?,
            color: DriftSet::new(color, seed.wrapping_add(1_000))?,
        })
    }
}

impl RenderRoutine for SpinnerRoutine {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.program.is_compiled()
    }

    fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> Result<()> {
        compile(&mut self.program, backend)
    }

    fn render(&mut self, backend: &mut dyn GraphicsBackend, delta_millis: f64) -> Result<()> {
        self.rotation.update(delta_millis);
        self.color.update(delta_millis);
        let [x, y, z] = self.rotation.values();
        let transform = Mat4::from_euler(
            EulerRot::XYZ,
            x.to_radians(),
            y.to_radians(),
            z.to_radians(),
        );
        let [r, g, b] = self.color.values();

        self.program.with_program(backend, |active| {
            active.set(
                "transform",
                UniformValue::Matrix(transform.to_cols_array().to_vec()),
            )?;
            active.set("tint", UniformValue::Float(vec![r, g, b, 1.0]))?;
            active.draw(3)?;
            Ok::<_, anyhow::Error>(())
        })
    }

    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        self.program.destroy(backend);
    }
}

/// Renders a flat gradient, then fails every frame past `fail_after`.
pub struct FaultyRoutine {
    name: String,
    program: ShaderProgram,
    fail_after: u64,
    recover_attempts: u32,
    frames: u64,
    recovered: u32,
}

impl FaultyRoutine {
    pub fn new(spec: &RoutineSpec) -> Self {
        let source = ShaderSource::new(FULLSCREEN_VERTEX, FLAT_FRAGMENT)
            .with_uniform(UniformDeclaration::floats("tint", &[0.9, 0.2, 0.2, 1.0]));
        Self {
            name: spec.name.clone(),
            program: ShaderProgram::new(spec.name.clone(), source),
            fail_after: spec.fail_after.unwrap_or(DEFAULT_FAIL_AFTER),
            recover_attempts: spec.recover_attempts,
            frames: 0,
            recovered: 0,
        }
    }
}

impl RenderRoutine for FaultyRoutine {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.program.is_compiled()
    }

    fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> Result<()> {
        compile(&mut self.program, backend)
    }

    fn render(&mut self, backend: &mut dyn GraphicsBackend, _delta_millis: f64) -> Result<()> {
        self.frames += 1;
        if self.frames > self.fail_after {
            anyhow::bail!(
                "routine '{}' gave up after {} frames",
                self.name,
                self.fail_after
            );
        }
        self.program.with_program(backend, |active| {
            active.draw(3)?;
            Ok::<_, anyhow::Error>(())
        })
    }

    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        self.program.destroy(backend);
    }

    fn handle_failure(
        &mut self,
        error: &anyhow::Error,
        context: &FailureContext,
    ) -> Result<FailureDisposition> {
        if context.stage != LifecycleStage::Render || self.recovered >= self.recover_attempts {
            return Ok(FailureDisposition::Unhandled);
        }
        self.recovered += 1;
        tracing::info!(
            routine = %self.name,
            attempt = self.recovered,
            error = %error,
            "absorbing render failure"
        );
        Ok(FailureDisposition::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderloop::{RecordingBackend, RenderDispatcher, TickOutcome};
    use std::time::Duration;

    fn spec(name: &str, kind: RoutineKind) -> RoutineSpec {
        RoutineSpec {
            name: name.to_string(),
            kind,
            frame_time: Duration::from_millis(100),
            textures: Vec::new(),
            fail_after: None,
            recover_attempts: 0,
        }
    }

    #[test]
    fn animated_routine_walks_its_textures() {
        let mut pulse = spec("pulse", RoutineKind::Animated);
        pulse.textures = vec!["#ff0000".into(), "missing".into(), "#00ff00".into()];
        let handle = build_routine(&pulse, &DriftSettings::default(), 1).unwrap();

        let mut dispatcher = RenderDispatcher::new(RecordingBackend::new());
        assert!(dispatcher.select_routine(&handle));
        assert_eq!(dispatcher.tick(50.0), TickOutcome::Rendered);
        let first = dispatcher.backend().bound_texture(0);
        assert!(first.is_some());
        assert_ne!(first, Some(RecordingBackend::FALLBACK_TEXTURE));

        assert_eq!(dispatcher.tick(100.0), TickOutcome::Rendered);
        assert_eq!(
            dispatcher.backend().bound_texture(0),
            Some(RecordingBackend::FALLBACK_TEXTURE)
        );
        assert_eq!(dispatcher.backend().counts().draws, 2);
        assert_eq!(dispatcher.backend().active_program(), None);
    }

    #[test]
    fn animated_routine_releases_its_textures() {
        let mut pulse = spec("pulse", RoutineKind::Animated);
        pulse.textures = vec!["#ff0000".into(), "#00ff00".into()];
        let handle = build_routine(&pulse, &DriftSettings::default(), 1).unwrap();

        let mut dispatcher = RenderDispatcher::new(RecordingBackend::new());
        assert!(dispatcher.select_routine(&handle));
        assert_eq!(dispatcher.backend().live_textures(), 2);
        assert_eq!(dispatcher.backend().live_programs(), 1);

        dispatcher.release_routine(&handle);
        assert_eq!(dispatcher.backend().live_textures(), 0);
        assert_eq!(dispatcher.backend().live_programs(), 0);

        // Selecting again rebuilds everything.
        assert!(dispatcher.select_routine(&handle));
        assert_eq!(dispatcher.backend().live_textures(), 2);
        assert_eq!(dispatcher.tick(16.0), TickOutcome::Rendered);
    }

    #[test]
    fn failed_texture_upload_leaves_nothing_behind() {
        let mut pulse = spec("pulse", RoutineKind::Animated);
        pulse.textures = vec!["#ff0000".into(), "#00ff00".into()];
        let handle = build_routine(&pulse, &DriftSettings::default(), 1).unwrap();

        let mut backend = RecordingBackend::new();
        backend.fail_texture_upload_after(1);
        let mut dispatcher = RenderDispatcher::new(backend);
        assert!(!dispatcher.select_routine(&handle));
        assert_eq!(dispatcher.backend().live_textures(), 0);
        assert_eq!(dispatcher.backend().live_programs(), 0);
        assert_eq!(dispatcher.take_failures()[0].stage, LifecycleStage::Initialize);
    }

    #[test]
    fn spinner_uploads_only_changed_uniforms() {
        let handle = build_routine(
            &spec("spinner", RoutineKind::Spinner),
            &DriftSettings::default(),
            3,
        )
        .unwrap();
        let mut dispatcher = RenderDispatcher::new(RecordingBackend::new());
        assert!(dispatcher.select_routine(&handle));

        dispatcher.tick(16.0);
        let after_first = dispatcher.backend().uniform_writes();
        assert!(after_first >= 2);
        // Nothing drifts without elapsed time.
        dispatcher.tick(0.0);
        assert_eq!(dispatcher.backend().uniform_writes(), after_first);
    }

    #[test]
    fn faulty_routine_recovers_then_gets_evicted() {
        let mut glitch = spec("glitch", RoutineKind::Faulty);
        glitch.fail_after = Some(2);
        glitch.recover_attempts = 1;
        let handle = build_routine(&glitch, &DriftSettings::default(), 0).unwrap();
        let mut dispatcher = RenderDispatcher::new(RecordingBackend::new());
        assert!(dispatcher.select_routine(&handle));

        assert_eq!(dispatcher.tick(16.0), TickOutcome::Rendered);
        assert_eq!(dispatcher.tick(16.0), TickOutcome::Rendered);
        assert_eq!(dispatcher.tick(16.0), TickOutcome::Recovered);
        assert_eq!(dispatcher.tick(16.0), TickOutcome::Evicted);
        assert_eq!(dispatcher.tick(16.0), TickOutcome::Idle);

        let failures = dispatcher.take_failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("gave up after 2 frames"));
    }

    #[test]
    fn compile_failure_fails_initialize() {
        let handle = build_routine(
            &spec("spinner", RoutineKind::Spinner),
            &DriftSettings::default(),
            0,
        )
        .unwrap();
        let mut backend = RecordingBackend::new();
        backend.fail_next_compile("bad wgsl");
        let mut dispatcher = RenderDispatcher::new(backend);
        assert!(!dispatcher.select_routine(&handle));
        let failures = dispatcher.take_failures();
        assert_eq!(failures[0].stage, LifecycleStage::Initialize);
        assert!(failures[0].message.contains("bad wgsl"));
    }
}
