use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_VIDEO_INTERVAL_MS: u64 = 500;
pub const DEFAULT_AUDIO_INTERVAL_MS: u64 = 300;
pub const DEFAULT_FFT_SIZE: u32 = 2048;
pub const DEFAULT_VIDEO_WIDTH: u32 = 640;
pub const DEFAULT_VIDEO_HEIGHT: u32 = 480;
pub const ENV_VIDEO_INTERVAL_MS: &str = "AFFECT_VIDEO_INTERVAL_MS";
pub const ENV_AUDIO_INTERVAL_MS: &str = "AFFECT_AUDIO_INTERVAL_MS";
pub const ENV_FFT_SIZE: &str = "AFFECT_FFT_SIZE";

const MIN_FFT_SIZE: u32 = 32;
const MAX_FFT_SIZE: u32 = 32_768;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickPeriod {
    pub millis: u64,
}

impl TickPeriod {
    pub fn new(millis: u64) -> Result<Self, ConfigError> {
        if millis == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(Self { millis })
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.millis)
    }
}

/// Analyser window length; the spectrum has `fft_size / 2` bins.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FftSize(u32);

impl FftSize {
    pub fn new(size: u32) -> Result<Self, ConfigError> {
        if !size.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&size) {
            return Err(ConfigError::InvalidFftSize(u64::from(size)));
        }
        Ok(Self(size))
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn bin_count(&self) -> usize {
        (self.0 / 2) as usize
    }
}

impl Default for FftSize {
    fn default() -> Self {
        Self(DEFAULT_FFT_SIZE)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FacingMode {
    User,
    Environment,
}

impl fmt::Display for FacingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacingMode::User => f.write_str("user"),
            FacingMode::Environment => f.write_str("environment"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub facing: FacingMode,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: DEFAULT_VIDEO_WIDTH,
            height: DEFAULT_VIDEO_HEIGHT,
            facing: FacingMode::User,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub fft_size: FftSize,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            fft_size: FftSize::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisConfig {
    pub video_interval: TickPeriod,
    pub audio_interval: TickPeriod,
    pub video: VideoConstraints,
    pub audio: AudioConstraints,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            video_interval: TickPeriod {
                millis: DEFAULT_VIDEO_INTERVAL_MS,
            },
            audio_interval: TickPeriod {
                millis: DEFAULT_AUDIO_INTERVAL_MS,
            },
            video: VideoConstraints::default(),
            audio: AudioConstraints::default(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tick interval must be > 0 ms")]
    ZeroInterval,
    #[error("fft size must be a power of two in 32..=32768, got {0}")]
    InvalidFftSize(u64),
    #[error("{key} must be an unsigned integer, got {value:?}")]
    NotANumber { key: String, value: String },
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: std::collections::BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

/// CLI value wins, then the environment, then `default`.
pub fn resolve_u64_with_default(
    cli_value: Option<u64>,
    env_key: &str,
    env: &impl Env,
    default: u64,
) -> Result<u64, ConfigError> {
    if let Some(v) = cli_value {
        return Ok(v);
    }
    match env.var(env_key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::NotANumber {
                key: env_key.to_owned(),
                value: raw,
            }),
        None => Ok(default),
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub video_interval_ms: Option<u64>,
    pub audio_interval_ms: Option<u64>,
    pub fft_size: Option<u32>,
}

impl AnalysisConfig {
    pub fn resolve(overrides: ConfigOverrides, env: &impl Env) -> Result<Self, ConfigError> {
        let video_ms = resolve_u64_with_default(
            overrides.video_interval_ms,
            ENV_VIDEO_INTERVAL_MS,
            env,
            DEFAULT_VIDEO_INTERVAL_MS,
        )?;
        let audio_ms = resolve_u64_with_default(
            overrides.audio_interval_ms,
            ENV_AUDIO_INTERVAL_MS,
            env,
            DEFAULT_AUDIO_INTERVAL_MS,
        )?;
        let fft = resolve_u64_with_default(
            overrides.fft_size.map(u64::from),
            ENV_FFT_SIZE,
            env,
            u64::from(DEFAULT_FFT_SIZE),
        )?;
        let fft = u32::try_from(fft).map_err(|_| ConfigError::InvalidFftSize(fft))?;

        Ok(Self {
            video_interval: TickPeriod::new(video_ms)?,
            audio_interval: TickPeriod::new(audio_ms)?,
            video: VideoConstraints::default(),
            audio: AudioConstraints {
                fft_size: FftSize::new(fft)?,
                ..AudioConstraints::default()
            },
        })
    }
}
