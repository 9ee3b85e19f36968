use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Recording,
    Wgpu,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Recording => f.write_str("recording"),
            BackendKind::Wgpu => f.write_str("wgpu"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutineKind {
    /// Cycles through `textures` every `frame_time`.
    Animated,
    /// Drifting rotation and tint.
    Spinner,
    /// Fails its render after `fail_after` frames.
    Faulty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoopConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub drift: DriftSettings,
    #[serde(default)]
    pub routines: Vec<RoutineSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostSettings {
    #[serde(default = "default_frames")]
    pub frames: u64,
    #[serde(
        default = "default_frame_delta",
        deserialize_with = "deserialize_duration"
    )]
    pub frame_delta: Duration,
    #[serde(default = "default_viewport")]
    pub viewport: [u32; 2],
    #[serde(default = "default_clear_color")]
    pub clear_color: [f32; 4],
    /// Switch to the next routine this often.
    #[serde(default, deserialize_with = "deserialize_duration_opt")]
    pub cycle: Option<Duration>,
    #[serde(default)]
    pub backend: BackendKind,
    /// Prefer a discrete GPU for the `wgpu` backend.
    #[serde(default)]
    pub high_performance: bool,
    /// Force a software adapter for the `wgpu` backend.
    #[serde(default)]
    pub software_adapter: bool,
    #[serde(default)]
    pub seed: u64,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            frames: default_frames(),
            frame_delta: default_frame_delta(),
            viewport: default_viewport(),
            clear_color: default_clear_color(),
            cycle: None,
            backend: BackendKind::default(),
            high_performance: false,
            software_adapter: false,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriftSettings {
    #[serde(default = "default_drift_step", deserialize_with = "deserialize_duration")]
    pub step: Duration,
    /// Degrees per step.
    #[serde(default = "default_rotation_speed")]
    pub rotation_speed: f32,
    /// Color channel change per step.
    #[serde(default = "default_color_speed")]
    pub color_speed: f32,
    /// Chance per step that a parked drift picks a new target.
    #[serde(default = "default_resume_probability")]
    pub resume_probability: f64,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            step: default_drift_step(),
            rotation_speed: default_rotation_speed(),
            color_speed: default_color_speed(),
            resume_probability: default_resume_probability(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutineSpec {
    pub name: String,
    pub kind: RoutineKind,
    #[serde(
        default = "default_frame_time",
        deserialize_with = "deserialize_duration"
    )]
    pub frame_time: Duration,
    /// `#rrggbb` or `#rrggbbaa`; `"missing"` leaves a gap the fallback fills.
    #[serde(default)]
    pub textures: Vec<String>,
    #[serde(default)]
    pub fail_after: Option<u64>,
    /// Failures the routine absorbs before giving up.
    #[serde(default)]
    pub recover_attempts: u32,
}

impl RoutineSpec {
    /// Parsed texture colors, `None` where the entry is missing.
    pub fn texture_colors(&self) -> Result<Vec<Option<[u8; 4]>>, ConfigError> {
        self.textures
            .iter()
            .map(|raw| {
                parse_color(raw).map_err(|reason| {
                    ConfigError::Invalid(format!(
                        "routine '{}' texture '{raw}': {reason}",
                        self.name
                    ))
                })
            })
            .collect()
    }
}

fn default_version() -> u32 {
    1
}

fn default_frames() -> u64 {
    600
}

fn default_frame_delta() -> Duration {
    Duration::from_millis(16)
}

fn default_viewport() -> [u32; 2] {
    [640, 360]
}

fn default_clear_color() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

fn default_drift_step() -> Duration {
    Duration::from_millis(10)
}

fn default_rotation_speed() -> f32 {
    1.0
}

fn default_color_speed() -> f32 {
    0.005
}

fn default_resume_probability() -> f64 {
    1.0 / 256.0
}

fn default_frame_time() -> Duration {
    Duration::from_millis(120)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer)?
        .ok_or_else(|| de::Error::custom("a duration is required here"))
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if !v.is_finite() || v.is_sign_negative() {
                return Err(E::custom("duration must be a non-negative number"));
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Parses `#rrggbb` / `#rrggbbaa`. `"missing"` (or an empty string) is `None`.
pub fn parse_color(raw: &str) -> Result<Option<[u8; 4]>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("missing") {
        return Ok(None);
    }
    let hex = trimmed
        .strip_prefix('#')
        .ok_or_else(|| "colors must start with '#'".to_string())?;
    if !(hex.len() == 6 || hex.len() == 8) || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err("expected 6 or 8 hex digits".into());
    }
    let channel = |index: usize| {
        u8::from_str_radix(&hex[index * 2..index * 2 + 2], 16)
            .map_err(|err| format!("bad channel: {err}"))
    };
    let alpha = if hex.len() == 8 { channel(3)? } else { 255 };
    Ok(Some([channel(0)?, channel(1)?, channel(2)?, alpha]))
}

impl Default for LoopConfig {
    /// Three-routine demo: an animated texture with a gap, a spinner, and a
    /// routine that breaks after a second of frames.
    fn default() -> Self {
        let routine = |name: &str, kind: RoutineKind| RoutineSpec {
            name: name.to_string(),
            kind,
            frame_time: default_frame_time(),
            textures: Vec::new(),
            fail_after: None,
            recover_attempts: 0,
        };
        let mut pulse = routine("pulse", RoutineKind::Animated);
        pulse.textures = ["#ff3b30", "#ff9500", "missing", "#34c759"]
            .iter()
            .map(|color| color.to_string())
            .collect();
        let mut glitch = routine("glitch", RoutineKind::Faulty);
        glitch.fail_after = Some(60);

        Self {
            version: default_version(),
            host: HostSettings {
                cycle: Some(Duration::from_secs(2)),
                ..HostSettings::default()
            },
            drift: DriftSettings::default(),
            routines: vec![pulse, routine("spinner", RoutineKind::Spinner), glitch],
        }
    }
}

impl LoopConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: LoopConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn routine(&self, name: &str) -> Option<&RoutineSpec> {
        self.routines.iter().find(|routine| routine.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        let host = &self.host;
        if host.frames == 0 {
            return Err(ConfigError::Invalid("host.frames must be > 0".into()));
        }
        if host.viewport.contains(&0) {
            return Err(ConfigError::Invalid(
                "host.viewport dimensions must be > 0".into(),
            ));
        }
        if host
            .clear_color
            .iter()
            .any(|channel| !(0.0..=1.0).contains(channel))
        {
            return Err(ConfigError::Invalid(
                "host.clear_color channels must be within [0, 1]".into(),
            ));
        }
        if host.cycle.is_some_and(|cycle| cycle.is_zero()) {
            return Err(ConfigError::Invalid("host.cycle must be > 0".into()));
        }

        let drift = &self.drift;
        if drift.step.is_zero() {
            return Err(ConfigError::Invalid("drift.step must be > 0".into()));
        }
        if !(drift.rotation_speed > 0.0 && drift.color_speed > 0.0) {
            return Err(ConfigError::Invalid(
                "drift speeds must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&drift.resume_probability) {
            return Err(ConfigError::Invalid(
                "drift.resume_probability must be within [0, 1]".into(),
            ));
        }

        if self.routines.is_empty() {
            return Err(ConfigError::Invalid(
                "config must define at least one routine".into(),
            ));
        }

        let mut seen = HashSet::new();
        for routine in &self.routines {
            let name = routine.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid(
                    "routine names may not be empty".into(),
                ));
            }
            if !seen.insert(name) {
                return Err(ConfigError::Invalid(format!(
                    "routine '{name}' is defined more than once"
                )));
            }
            if routine.frame_time.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "routine '{name}' frame_time must be > 0"
                )));
            }
            if routine.fail_after.is_some() && routine.kind != RoutineKind::Faulty {
                return Err(ConfigError::Invalid(format!(
                    "routine '{name}' sets fail_after but is not faulty"
                )));
            }
            routine.texture_colors()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
version = 1

[host]
frames = 240
frame_delta = "16ms"
viewport = [320, 200]
clear_color = [0.1, 0.1, 0.1, 1.0]
cycle = "1s"
backend = "recording"
seed = 7
software_adapter = true

[drift]
step = "10ms"
rotation_speed = 2.5
resume_probability = 0.01

[[routines]]
name = "pulse"
kind = "animated"
frame_time = "120ms"
textures = ["#ff0000", "missing", "#0000ff80"]

[[routines]]
name = "spinner"
kind = "spinner"

[[routines]]
name = "glitch"
kind = "faulty"
fail_after = 30
recover_attempts = 2
"##;

    #[test]
    fn parses_sample_config() {
        let config = LoopConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.host.frames, 240);
        assert_eq!(config.host.frame_delta, Duration::from_millis(16));
        assert_eq!(config.host.cycle, Some(Duration::from_secs(1)));
        assert!(config.host.software_adapter);
        assert!(!config.host.high_performance);
        assert_eq!(config.host.backend, BackendKind::Recording);
        assert_eq!(config.drift.rotation_speed, 2.5);
        assert_eq!(config.drift.color_speed, default_color_speed());
        assert_eq!(config.routines.len(), 3);

        let glitch = config.routine("glitch").expect("glitch routine");
        assert_eq!(glitch.kind, RoutineKind::Faulty);
        assert_eq!(glitch.fail_after, Some(30));
        assert_eq!(glitch.recover_attempts, 2);
        assert_eq!(
            config.routine("spinner").map(|routine| routine.frame_time),
            Some(Duration::from_millis(120))
        );
    }

    #[test]
    fn texture_colors_keep_gaps() {
        let config = LoopConfig::from_toml_str(SAMPLE).expect("parse config");
        let colors = config
            .routine("pulse")
            .map(RoutineSpec::texture_colors)
            .expect("pulse routine")
            .expect("colors");
        assert_eq!(
            colors,
            vec![Some([255, 0, 0, 255]), None, Some([0, 0, 255, 128])]
        );
    }

    #[test]
    fn numeric_durations_are_seconds() {
        let config = LoopConfig::from_toml_str(
            r#"
[host]
frame_delta = 0.02

[[routines]]
name = "a"
kind = "spinner"
frame_time = 1
"#,
        )
        .expect("parse config");
        assert_eq!(config.host.frame_delta, Duration::from_millis(20));
        assert_eq!(config.routines[0].frame_time, Duration::from_secs(1));
    }

    #[test]
    fn rejects_duplicate_routines() {
        let err = LoopConfig::from_toml_str(
            r#"
[[routines]]
name = "a"
kind = "spinner"

[[routines]]
name = "a"
kind = "animated"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(message) if message.contains("more than once")));
    }

    #[test]
    fn rejects_bad_values() {
        let cases = [
            "[host]\nframes = 0\n",
            "[host]\ncycle = \"0s\"\n",
            "[host]\nclear_color = [2.0, 0.0, 0.0, 1.0]\n",
            "[drift]\nresume_probability = 1.5\n",
            "[drift]\nrotation_speed = 0.0\n",
        ];
        for case in cases {
            let input = format!("{case}\n[[routines]]\nname = \"a\"\nkind = \"spinner\"\n");
            assert!(
                matches!(
                    LoopConfig::from_toml_str(&input),
                    Err(ConfigError::Invalid(_))
                ),
                "accepted: {case}"
            );
        }
    }

    #[test]
    fn rejects_bad_texture_and_misplaced_failure() {
        let bad_color = r##"
[[routines]]
name = "a"
kind = "animated"
textures = ["#12345"]
"##;
        assert!(matches!(
            LoopConfig::from_toml_str(bad_color),
            Err(ConfigError::Invalid(_))
        ));

        let misplaced = r#"
[[routines]]
name = "a"
kind = "spinner"
fail_after = 3
"#;
        assert!(matches!(
            LoopConfig::from_toml_str(misplaced),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(matches!(
            LoopConfig::from_toml_str("[[routines]]\nname = \"a\"\nkind = \"teapot\"\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            LoopConfig::from_toml_str("[host]\nframe_delta = \"soon\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn empty_config_needs_routines() {
        assert!(matches!(
            LoopConfig::from_toml_str(""),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn builtin_config_is_valid() {
        let config = LoopConfig::default();
        config.validate().expect("builtin config validates");
        assert_eq!(config.routines.len(), 3);
    }
}
