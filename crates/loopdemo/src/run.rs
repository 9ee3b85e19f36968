use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use loopconfig::{BackendKind, LoopConfig, RoutineKind};
use renderloop::{
    FailureReport, FrameAccumulator, GraphicsBackend, RecordingBackend, RenderDispatcher,
    RoutineHandle, RoutineId, TickOutcome, Viewport,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::cli::{ReportFormat, RunArgs};
use crate::routines::build_routine;

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

pub fn load_config(path: Option<&Path>) -> Result<LoopConfig> {
    let Some(path) = path else {
        tracing::debug!("no --config given; using the built-in demo configuration");
        return Ok(LoopConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    LoopConfig::from_toml_str(&raw)
        .with_context(|| format!("failed to load config at {}", path.display()))
}

pub fn check(path: &Path) -> Result<()> {
    let config = load_config(Some(path))?;
    println!("{}: ok", path.display());
    println!(
        "  host: {} frames at {:?}, backend {}",
        config.host.frames, config.host.frame_delta, config.host.backend
    );
    for routine in &config.routines {
        println!(
            "  {:<16} kind={:<8} frame_time={:?}",
            routine.name,
            kind_name(routine.kind),
            routine.frame_time
        );
    }
    Ok(())
}

/// Resolved run parameters after CLI overrides.
#[derive(Debug, Clone)]
struct RunPlan {
    frames: u64,
    delta_millis: f64,
    start: usize,
    backend: BackendKind,
}

impl RunPlan {
    fn resolve(args: &RunArgs, config: &LoopConfig) -> Result<Self> {
        let start = match args.routine.as_deref() {
            Some(name) => config
                .routines
                .iter()
                .position(|routine| routine.name == name)
                .with_context(|| {
                    let known: Vec<&str> = config
                        .routines
                        .iter()
                        .map(|routine| routine.name.as_str())
                        .collect();
                    format!("unknown routine '{name}'; configured: {}", known.join(", "))
                })?,
            None => 0,
        };
        let frames = args.frames.unwrap_or(config.host.frames);
        if frames == 0 {
            anyhow::bail!("--frames must be greater than zero");
        }
        Ok(Self {
            frames,
            delta_millis: args
                .delta_ms
                .unwrap_or_else(|| config.host.frame_delta.as_secs_f64() * 1000.0),
            start,
            backend: args.backend.unwrap_or(config.host.backend),
        })
    }
}

pub fn run(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let plan = RunPlan::resolve(&args, &config)?;
    tracing::info!(
        frames = plan.frames,
        delta_ms = plan.delta_millis,
        backend = %plan.backend,
        routines = config.routines.len(),
        "starting render loop"
    );

    let report = match plan.backend {
        BackendKind::Recording => drive(RecordingBackend::new(), &config, &plan)?,
        BackendKind::Wgpu => drive_wgpu(&config, &plan)?,
    };

    match args.report {
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        ReportFormat::Text => print_text_report(&report),
    }
    Ok(())
}

#[cfg(feature = "wgpu")]
fn drive_wgpu(config: &LoopConfig, plan: &RunPlan) -> Result<RunReport> {
    use renderloop::gpu::{GpuOptions, GpuPower, WgpuBackend};

    let [width, height] = config.host.viewport;
    let power = if config.host.high_performance {
        GpuPower::High
    } else {
        GpuPower::Low
    };
    let backend = WgpuBackend::new(GpuOptions {
        width,
        height,
        power,
        force_fallback_adapter: config.host.software_adapter,
    })
    .context("failed to initialise the wgpu backend")?;
    drive(backend, config, plan)
}

#[cfg(not(feature = "wgpu"))]
fn drive_wgpu(_config: &LoopConfig, _plan: &RunPlan) -> Result<RunReport> {
    anyhow::bail!("loopdemo was built without the `wgpu` feature")
}

/// Backend-specific numbers for the run report.
trait HostBackend: GraphicsBackend {
    fn summary(&self) -> Result<BackendSummary>;
}

impl HostBackend for RecordingBackend {
    fn summary(&self) -> Result<BackendSummary> {
        let counts = self.counts();
        Ok(BackendSummary {
            kind: BackendKind::Recording.to_string(),
            adapter: None,
            draws: Some(counts.draws),
            uniform_writes: Some(counts.uniform_writes),
            lit_pixels: None,
        })
    }
}

#[cfg(feature = "wgpu")]
impl HostBackend for renderloop::gpu::WgpuBackend {
    fn summary(&self) -> Result<BackendSummary> {
        let pixels = self
            .read_pixels()
            .context("failed to read back the render target")?;
        let lit = pixels
            .chunks_exact(4)
            .filter(|pixel| pixel[..3].iter().any(|channel| *channel != 0))
            .count();
        Ok(BackendSummary {
            kind: BackendKind::Wgpu.to_string(),
            adapter: Some(self.adapter_name().to_string()),
            draws: None,
            uniform_writes: None,
            lit_pixels: Some(lit),
        })
    }
}

struct HostRoutine {
    name: String,
    kind: RoutineKind,
    handle: RoutineHandle,
    frames_rendered: u64,
}

/// Owns the dispatcher and the routine instances for one run.
struct HostLoop<B> {
    dispatcher: RenderDispatcher<B>,
    routines: Vec<HostRoutine>,
    current: Option<usize>,
    cycle: Option<FrameAccumulator>,
    evicted: HashSet<RoutineId>,
    switches: u64,
    failures: Vec<FailureReport>,
}

impl<B: GraphicsBackend> HostLoop<B> {
    fn select_from(&mut self, start: usize) {
        let len = self.routines.len();
        for offset in 0..len {
            let index = (start + offset) % len;
            let handle = &self.routines[index].handle;
            if self.evicted.contains(&handle.id()) {
                continue;
            }
            if self.dispatcher.select_routine(handle) {
                if self.current != Some(index) {
                    self.switches += 1;
                    tracing::debug!(routine = %self.routines[index].name, "switched routine");
                }
                self.current = Some(index);
                return;
            }
            self.evicted.insert(handle.id());
        }
        if self.current.take().is_some() || self.switches == 0 {
            tracing::warn!("no healthy routine left; ticking idle");
        }
    }

    fn next_index(&self, steps: usize) -> usize {
        self.current.map_or(0, |current| current + steps)
    }

    fn frame(&mut self, delta_millis: f64) -> Result<()> {
        self.dispatcher
            .backend_mut()
            .clear()
            .context("failed to clear the frame")?;

        match self.dispatcher.tick(delta_millis) {
            TickOutcome::Rendered => {
                if let Some(index) = self.current {
                    self.routines[index].frames_rendered += 1;
                }
            }
            TickOutcome::Evicted => {
                if let Some(index) = self.current {
                    self.evicted.insert(self.routines[index].handle.id());
                }
                let next = self.next_index(1);
                self.select_from(next);
            }
            TickOutcome::Recovered | TickOutcome::Idle => {}
        }

        let advances = self
            .cycle
            .as_mut()
            .map_or(0, |cycle| cycle.update(delta_millis));
        if advances > 0 && self.routines.len() > 1 && self.current.is_some() {
            let next = self.next_index(advances as usize);
            self.select_from(next);
        }

        self.failures.extend(self.dispatcher.take_failures());
        Ok(())
    }
}

fn drive<B: HostBackend>(mut backend: B, config: &LoopConfig, plan: &RunPlan) -> Result<RunReport> {
    let [width, height] = config.host.viewport;
    backend.set_viewport(Viewport::new(width, height));
    backend.clear_color(config.host.clear_color);

    let routines = config
        .routines
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            let seed = config.host.seed.wrapping_add(index as u64);
            let handle = build_routine(spec, &config.drift, seed)
                .with_context(|| format!("failed to build routine '{}'", spec.name))?;
            Ok(HostRoutine {
                name: spec.name.clone(),
                kind: spec.kind,
                handle,
                frames_rendered: 0,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let cycle = config
        .host
        .cycle
        .map(|cycle| FrameAccumulator::new(cycle.as_secs_f64() * 1000.0))
        .transpose()
        .context("invalid routine cycle interval")?;

    let mut host = HostLoop {
        dispatcher: RenderDispatcher::new(backend),
        routines,
        current: None,
        cycle,
        evicted: HashSet::new(),
        switches: 0,
        failures: Vec::new(),
    };
    host.select_from(plan.start);

    for _ in 0..plan.frames {
        host.frame(plan.delta_millis)?;
    }
    host.dispatcher.deselect();
    host.failures.extend(host.dispatcher.take_failures());

    let stats = host.dispatcher.stats();
    let routines = host
        .routines
        .iter()
        .map(|routine| RoutineReport {
            name: routine.name.clone(),
            kind: kind_name(routine.kind).to_string(),
            state: format!("{:?}", host.dispatcher.state_of(&routine.handle)).to_lowercase(),
            frames_rendered: routine.frames_rendered,
        })
        .collect();
    let failures = host
        .failures
        .iter()
        .map(|failure| FailureEntry {
            routine: failure.name.clone(),
            stage: failure.stage.to_string(),
            message: failure.message.clone(),
        })
        .collect();

    let backend = host.dispatcher.backend().summary()?;
    for routine in &host.routines {
        host.dispatcher.release_routine(&routine.handle);
    }

    Ok(RunReport {
        frames: plan.frames,
        delta_ms: plan.delta_millis,
        backend,
        switches: host.switches,
        frames_rendered: stats.frames_rendered,
        idle_ticks: stats.idle_ticks,
        failures_handled: stats.failures_handled,
        routines_evicted: stats.routines_evicted,
        routines,
        failures,
    })
}

fn kind_name(kind: RoutineKind) -> &'static str {
    match kind {
        RoutineKind::Animated => "animated",
        RoutineKind::Spinner => "spinner",
        RoutineKind::Faulty => "faulty",
    }
}

#[derive(Debug, Serialize)]
pub struct BackendSummary {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draws: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uniform_writes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lit_pixels: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RoutineReport {
    pub name: String,
    pub kind: String,
    pub state: String,
    pub frames_rendered: u64,
}

#[derive(Debug, Serialize)]
pub struct FailureEntry {
    pub routine: String,
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub frames: u64,
    pub delta_ms: f64,
    pub backend: BackendSummary,
    pub switches: u64,
    pub frames_rendered: u64,
    pub idle_ticks: u64,
    pub failures_handled: u64,
    pub routines_evicted: u64,
    pub routines: Vec<RoutineReport>,
    pub failures: Vec<FailureEntry>,
}

fn print_text_report(report: &RunReport) {
    println!(
        "Ran {} frames at {:.2} ms on the {} backend",
        report.frames, report.delta_ms, report.backend.kind
    );
    if let Some(adapter) = &report.backend.adapter {
        println!("  adapter:          {adapter}");
    }
    if let Some(lit) = report.backend.lit_pixels {
        println!("  lit pixels:       {lit}");
    }
    if let Some(draws) = report.backend.draws {
        println!("  draws:            {draws}");
    }
    if let Some(writes) = report.backend.uniform_writes {
        println!("  uniform writes:   {writes}");
    }
    println!("  frames rendered:  {}", report.frames_rendered);
    println!("  idle ticks:       {}", report.idle_ticks);
    println!("  routine switches: {}", report.switches);
    println!("Routines:");
    for routine in &report.routines {
        println!(
            "  {:<16} kind={:<8} state={:<12} frames={}",
            routine.name, routine.kind, routine.state, routine.frames_rendered
        );
    }
    if !report.failures.is_empty() {
        println!("Failures:");
        for failure in &report.failures {
            println!(
                "  {:<16} {:<14} {}",
                failure.routine, failure.stage, failure.message
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(frames: u64, start: usize) -> RunPlan {
        RunPlan {
            frames,
            delta_millis: 16.0,
            start,
            backend: BackendKind::Recording,
        }
    }

    #[test]
    fn builtin_run_survives_a_faulty_routine() {
        let config = LoopConfig::default();
        let report = drive(RecordingBackend::new(), &config, &plan(600, 0)).unwrap();
        assert_eq!(report.frames, 600);
        assert!(report.routines_evicted >= 1);
        assert_eq!(report.failures[0].routine, "glitch");
        assert_eq!(report.failures[0].stage, "render");
        assert_eq!(report.idle_ticks, 0);
        assert!(report.switches >= 3);
    }

    #[test]
    fn evicted_routine_is_not_selected_again() {
        let config = LoopConfig::from_toml_str(
            "[[routines]]\nname = \"glitch\"\nkind = \"faulty\"\nfail_after = 0\n",
        )
        .unwrap();
        let report = drive(RecordingBackend::new(), &config, &plan(100, 0)).unwrap();
        assert_eq!(report.routines_evicted, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.idle_ticks, 99);
        assert_eq!(report.frames_rendered, 0);
    }

    #[test]
    fn cycling_skips_evicted_routines() {
        let config = LoopConfig::from_toml_str(
            r#"
[host]
cycle = "32ms"

[[routines]]
name = "spinner"
kind = "spinner"

[[routines]]
name = "glitch"
kind = "faulty"
fail_after = 0
"#,
        )
        .unwrap();
        let report = drive(RecordingBackend::new(), &config, &plan(50, 0)).unwrap();
        assert_eq!(report.routines_evicted, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.idle_ticks, 0);
        assert_eq!(report.routines[0].frames_rendered, 49);
    }

    #[test]
    fn unknown_start_routine_is_an_error() {
        let config = LoopConfig::default();
        let args = RunArgs {
            routine: Some("teapot".into()),
            ..RunArgs::default()
        };
        let err = RunPlan::resolve(&args, &config).unwrap_err();
        assert!(err.to_string().contains("unknown routine 'teapot'"));
    }

    #[test]
    fn cli_overrides_config() {
        let config = LoopConfig::default();
        let args = RunArgs {
            frames: Some(5),
            delta_ms: Some(8.0),
            routine: Some("spinner".into()),
            ..RunArgs::default()
        };
        let plan = RunPlan::resolve(&args, &config).unwrap();
        assert_eq!(plan.frames, 5);
        assert_eq!(plan.delta_millis, 8.0);
        assert_eq!(plan.start, 1);
        assert_eq!(plan.backend, BackendKind::Recording);
    }

    #[test]
    fn single_routine_renders_every_frame() {
        let config = LoopConfig::from_toml_str(
            "[[routines]]\nname = \"solo\"\nkind = \"spinner\"\n",
        )
        .unwrap();
        let report = drive(RecordingBackend::new(), &config, &plan(10, 0)).unwrap();
        assert_eq!(report.frames_rendered, 10);
        assert_eq!(report.routines[0].frames_rendered, 10);
        assert_eq!(report.routines[0].state, "deselected");
        assert_eq!(report.backend.draws, Some(10));
        assert!(report.failures.is_empty());
    }
}
