//! Configuration management for live-session

use crate::engine::{AudioConstraints, CaptureConstraints, VideoConstraints};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Signaling endpoint configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Session supervision (health checks, reconnection)
    #[serde(default)]
    pub session: SessionConfig,

    /// Viewer consume retries
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Local capture constraints (broadcaster)
    #[serde(default)]
    pub capture: CaptureConstraints,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket URL of the SFU signaling endpoint
    #[serde(default = "default_signaling_url")]
    pub url: String,

    /// Time allowed for the WebSocket handshake
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Producer health check period
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Consecutive reconnect attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// First reconnect delay; doubles on each attempt
    #[serde(default = "default_reconnect_base_delay_secs")]
    pub reconnect_base_delay_secs: u64,

    /// Hold the receive connect until the server sends `consumerTransportConnected`
    #[serde(default)]
    pub await_consumer_ack: bool,

    /// Ack wait before the receive connect fails (only with `await_consumer_ack`)
    #[serde(default = "default_consumer_connect_timeout_secs")]
    pub consumer_connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Delay before re-requesting a kind that had no producer
    #[serde(default = "default_no_producer_retry_delay_ms")]
    pub no_producer_retry_delay_ms: u64,

    /// Backoff base for consume requests that could not be sent
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_secs: default_reconnect_base_delay_secs(),
            await_consumer_ack: false,
            consumer_connect_timeout_secs: default_consumer_connect_timeout_secs(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            no_producer_retry_delay_ms: default_no_producer_retry_delay_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            audio: AudioConstraints {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
                channel_count: 2,
                sample_rate: 48_000,
            },
            video: VideoConstraints {
                ideal_width: 1280,
                ideal_height: 720,
                max_width: 1920,
                max_height: 1080,
                max_frame_rate: 60,
                facing_mode: "user".to_string(),
            },
        }
    }
}

impl SignalingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl SessionConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_delay_secs)
    }

    pub fn consumer_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer_connect_timeout_secs)
    }
}

impl ConsumerConfig {
    pub fn no_producer_retry_delay(&self) -> Duration {
        Duration::from_millis(self.no_producer_retry_delay_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let url = self.signaling.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err("Signaling url must use the ws:// or wss:// scheme".into());
        }

        if self.signaling.connect_timeout_secs == 0 {
            return Err("Signaling connect timeout must be non-zero".into());
        }

        if self.session.health_check_interval_secs == 0 {
            return Err("Health check interval must be non-zero".into());
        }

        if self.session.reconnect_base_delay_secs == 0 {
            return Err("Reconnect base delay must be non-zero".into());
        }

        // 2^attempt must stay representable
        if self.session.max_reconnect_attempts > 16 || self.consumer.retry_max_attempts > 16 {
            return Err("Retry attempts are capped at 16".into());
        }

        if self.consumer.retry_base_delay_ms == 0 {
            return Err("Consumer retry base delay must be non-zero".into());
        }

        let audio = &self.capture.audio;
        if audio.channel_count == 0 || audio.channel_count > 2 {
            return Err("Capture audio channel_count must be 1 or 2".into());
        }
        if audio.sample_rate == 0 {
            return Err("Capture audio sample rate must be non-zero".into());
        }

        let video = &self.capture.video;
        if video.ideal_width == 0 || video.ideal_height == 0 {
            return Err("Capture video dimensions must be non-zero".into());
        }
        if video.ideal_width > video.max_width || video.ideal_height > video.max_height {
            return Err("Capture ideal resolution cannot exceed max resolution".into());
        }
        if video.max_frame_rate == 0 {
            return Err("Capture frame rate must be non-zero".into());
        }

        Ok(())
    }
}


fn default_signaling_url() -> String {
    "ws://127.0.0.1:3016".to_string()
}

fn default_connect_timeout_secs() -> u64 { 10 }
fn default_health_check_interval_secs() -> u64 { 5 }
fn default_max_reconnect_attempts() -> u32 { 5 }
fn default_reconnect_base_delay_secs() -> u64 { 1 }
fn default_consumer_connect_timeout_secs() -> u64 { 10 }
fn default_no_producer_retry_delay_ms() -> u64 { 2000 }
fn default_retry_base_delay_ms() -> u64 { 1000 }
fn default_retry_max_attempts() -> u32 { 5 }

fn default_log_level() -> String {
    "info".to_string()
}
