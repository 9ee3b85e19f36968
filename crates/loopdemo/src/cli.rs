use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use loopconfig::BackendKind;

#[derive(Parser, Debug)]
#[command(
    name = "loopdemo",
    author,
    version,
    about = "Drive demo render routines through the renderloop dispatcher",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// Host configuration TOML; the built-in demo is used when omitted.
    #[arg(long, value_name = "FILE", env = "LOOPDEMO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of frames to run (overrides `host.frames`).
    #[arg(long, value_name = "COUNT")]
    pub frames: Option<u64>,

    /// Fixed frame delta in milliseconds (overrides `host.frame_delta`).
    #[arg(long, value_name = "MILLISECONDS", value_parser = parse_delta_ms)]
    pub delta_ms: Option<f64>,

    /// Routine to select first instead of the first configured one.
    #[arg(long, value_name = "NAME")]
    pub routine: Option<String>,

    /// Graphics backend: `recording` (no GPU) or `wgpu` (offscreen).
    #[arg(long, value_name = "BACKEND", value_parser = parse_backend)]
    pub backend: Option<BackendKind>,

    /// Summary format printed after the run.
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = ReportFormat::Text)]
    pub report: ReportFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a configuration file and list its routines.
    Check(CheckArgs),
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[arg(value_name = "FILE")]
    pub config: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_backend(value: &str) -> Result<BackendKind, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "recording" | "headless" | "none" => Ok(BackendKind::Recording),
        "wgpu" | "gpu" => Ok(BackendKind::Wgpu),
        other => Err(format!(
            "unknown backend '{other}'; expected 'recording' or 'wgpu'"
        )),
    }
}

pub fn parse_delta_ms(value: &str) -> Result<f64, String> {
    let delta: f64 = value
        .trim()
        .parse()
        .map_err(|err| format!("invalid delta '{value}': {err}"))?;
    if !delta.is_finite() || delta < 0.0 {
        return Err(format!("delta must be a non-negative number, got {value}"));
    }
    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_aliases() {
        assert_eq!(parse_backend("WGPU"), Ok(BackendKind::Wgpu));
        assert_eq!(parse_backend("headless"), Ok(BackendKind::Recording));
        assert!(parse_backend("vulkan").is_err());
    }

    #[test]
    fn rejects_negative_delta() {
        assert_eq!(parse_delta_ms("16.5"), Ok(16.5));
        assert!(parse_delta_ms("-1").is_err());
        assert!(parse_delta_ms("NaN").is_err());
        assert!(parse_delta_ms("fast").is_err());
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "loopdemo",
            "--frames",
            "10",
            "--delta-ms",
            "8",
            "--routine",
            "spinner",
            "--backend",
            "recording",
            "--report",
            "json",
        ])
        .expect("parse flags");
        assert_eq!(cli.run.frames, Some(10));
        assert_eq!(cli.run.delta_ms, Some(8.0));
        assert_eq!(cli.run.routine.as_deref(), Some("spinner"));
        assert_eq!(cli.run.backend, Some(BackendKind::Recording));
        assert_eq!(cli.run.report, ReportFormat::Json);
        assert!(cli.command.is_none());
    }
}
