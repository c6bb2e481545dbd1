use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub voice: VoiceConfig,
    pub rtc: RtcConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Coordinator tuning: grace period, voice activity detection, volume ramp
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// How long a disconnected peer link is kept before teardown
    pub grace_period_ms: u64,
    /// Average byte-frequency energy (0-255) above which a frame counts as voiced
    pub speaking_threshold: f32,
    /// Consecutive voiced frames before a participant is marked speaking
    pub speaking_frames: u32,
    /// Consecutive silent frames before a participant is marked silent
    pub silence_frames: u32,
    /// Analysis tick, roughly one display frame
    pub analysis_interval_ms: u64,
    /// FFT window size (power of two); yields `fft_size / 2` frequency bins
    pub fft_size: usize,
    /// Spectrum smoothing between analysis ticks (0.0 - 1.0)
    pub smoothing_time_constant: f32,
    /// Duration of the master gain ramp applied by `set_volume`
    pub volume_ramp_ms: u64,
    /// Initial remote volume in percent
    pub default_volume: u8,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5000,
            speaking_threshold: 20.0,
            speaking_frames: 5,
            silence_frames: 10,
            analysis_interval_ms: 16,
            fft_size: 256,
            smoothing_time_constant: 0.8,
            volume_ramp_ms: 50,
            default_volume: 100,
        }
    }
}

impl VoiceConfig {
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub const fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms)
    }

    #[must_use]
    pub const fn volume_ramp(&self) -> Duration {
        Duration::from_millis(self.volume_ramp_ms)
    }
}

/// ICE server configuration
///
/// The relay credentials are optional; without them only STUN is used, which
/// lowers the connection success rate on restrictive networks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// Public STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server URL (e.g., "turn:turn.example.com:3478")
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn_url: None,
            turn_username: None,
            turn_credential: None,
        }
    }
}

/// A single ICE server entry handed to the peer connection backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl RtcConfig {
    /// Default relay list, with the TURN relay appended when fully configured
    #[must_use]
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = Vec::with_capacity(2);
        if !self.stun_servers.is_empty() {
            servers.push(IceServer {
                urls: self.stun_servers.clone(),
                username: None,
                credential: None,
            });
        }

        if let (Some(url), Some(username), Some(credential)) =
            (&self.turn_url, &self.turn_username, &self.turn_credential)
        {
            servers.push(IceServer {
                urls: vec![url.clone()],
                username: Some(username.clone()),
                credential: Some(credential.clone()),
            });
        }

        servers
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Redis URL for pub/sub signaling; empty selects the in-process hub
    pub redis_url: String,
    /// Channel name prefix; the room name is appended
    pub channel_prefix: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            channel_prefix: "roomvoice:room:".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ROOMVOICE_RTC__TURN_URL, ROOMVOICE_VOICE__GRACE_PERIOD_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("ROOMVOICE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Check semantic constraints that deserialization cannot express
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let voice = &self.voice;

        if voice.default_volume > 100 {
            errors.push(format!(
                "voice.default_volume must be 0-100, got {}",
                voice.default_volume
            ));
        }
        if voice.speaking_frames == 0 || voice.silence_frames == 0 {
            errors.push("voice.speaking_frames and voice.silence_frames must be > 0".to_string());
        }
        if !voice.fft_size.is_power_of_two() || voice.fft_size < 32 {
            errors.push(format!(
                "voice.fft_size must be a power of two >= 32, got {}",
                voice.fft_size
            ));
        }
        if !(0.0..1.0).contains(&voice.smoothing_time_constant) {
            errors.push("voice.smoothing_time_constant must be in [0, 1)".to_string());
        }
        if voice.analysis_interval_ms == 0 {
            errors.push("voice.analysis_interval_ms must be > 0".to_string());
        }

        let turn_fields = [
            self.rtc.turn_url.is_some(),
            self.rtc.turn_username.is_some(),
            self.rtc.turn_credential.is_some(),
        ];
        if turn_fields.iter().any(|set| *set) && !turn_fields.iter().all(|set| *set) {
            errors.push(
                "rtc.turn_url, rtc.turn_username and rtc.turn_credential must be set together"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
