//! Configuration types for the streaming engine

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for StreamingEngine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the platform REST API (live-view endpoint lives below it)
    pub api_base_url: String,

    /// URL template for the direct strategy (`{camera}` and `{width}` are substituted)
    pub direct_stream_url: String,

    /// Transcoder process settings
    pub transcoder: TranscoderConfig,

    /// Deadlines
    pub timeouts: TimeoutConfig,

    /// Snapshot cache lifetime in seconds (default: 60)
    pub snapshot_ttl_secs: u64,

    /// Bounded queue depth for decoded frames (default: 8)
    pub frame_queue_depth: usize,

    /// Bounded queue depth for RTP payloads per track (default: 256)
    pub packet_queue_depth: usize,

    /// Address reported by `prepare` (auto-detected when None)
    pub local_address: Option<IpAddr>,

    /// Outbound RTP packet size (default: 1316)
    pub mtu: u16,
}

/// Transcoder (FFmpeg) process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    /// Executable to spawn (default: "ffmpeg")
    pub path: PathBuf,

    /// Extra arguments inserted before the first `-i`
    pub extra_input_args: Vec<String>,

    /// Video encoder (default: "libx264")
    pub video_encoder: String,

    /// Audio encoder for Opus output (default: "libopus")
    pub opus_encoder: String,

    /// Audio encoder for AAC-ELD output (default: "libfdk_aac")
    pub aac_encoder: String,

    /// Transcoder log level; must be verbose enough to emit a first line (default: "info")
    pub log_level: String,

    /// Time allowed for the input writer to drain after close (default: 500ms)
    pub input_close_grace_ms: u64,

    /// Time allowed between SIGTERM and SIGKILL (default: 2000ms)
    pub stop_grace_ms: u64,
}

/// Deadlines applied to session establishment and snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend establishment deadline in seconds (default: 20)
    pub establish_secs: u64,

    /// Wait for first transcoder output in seconds (default: 15)
    pub first_output_secs: u64,

    /// Whole-snapshot deadline in seconds (default: 10, must be < establish_secs)
    pub snapshot_secs: u64,

    /// HTTP request timeout in seconds (default: 10)
    pub http_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.example.com".to_string(),
            direct_stream_url: "https://media.example.com/v1/{camera}/flv?x={width}".to_string(),
            transcoder: TranscoderConfig::default(),
            timeouts: TimeoutConfig::default(),
            snapshot_ttl_secs: 60,
            frame_queue_depth: 8,
            packet_queue_depth: 256,
            local_address: None,
            mtu: 1316,
        }
    }
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ffmpeg"),
            extra_input_args: Vec::new(),
            video_encoder: "libx264".to_string(),
            opus_encoder: "libopus".to_string(),
            aac_encoder: "libfdk_aac".to_string(),
            log_level: "info".to_string(),
            input_close_grace_ms: 500,
            stop_grace_ms: 2000,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            establish_secs: 20,
            first_output_secs: 15,
            snapshot_secs: 10,
            http_secs: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn establish(&self) -> Duration {
        Duration::from_secs(self.establish_secs)
    }

    pub fn first_output(&self) -> Duration {
        Duration::from_secs(self.first_output_secs)
    }

    pub fn snapshot(&self) -> Duration {
        Duration::from_secs(self.snapshot_secs)
    }

    pub fn http(&self) -> Duration {
        Duration::from_secs(self.http_secs)
    }
}

impl TranscoderConfig {
    pub fn input_close_grace(&self) -> Duration {
        Duration::from_millis(self.input_close_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text; missing keys take defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `api_base_url` is not an http(s) URL
    /// - any timeout is zero
    /// - `snapshot_secs` is not strictly shorter than `establish_secs`
    /// - a queue depth is zero
    /// - `mtu` is below 188 bytes
    pub fn validate(&self) -> Result<()> {
        let api = url::Url::parse(&self.api_base_url).map_err(|e| {
            Error::InvalidConfig(format!("api_base_url is not a URL ({}): {}", e, self.api_base_url))
        })?;
        if api.scheme() != "http" && api.scheme() != "https" {
            return Err(Error::InvalidConfig(format!(
                "api_base_url must start with http:// or https://, got {}",
                self.api_base_url
            )));
        }

        let t = &self.timeouts;
        if t.establish_secs == 0 || t.first_output_secs == 0 || t.snapshot_secs == 0 || t.http_secs == 0
        {
            return Err(Error::InvalidConfig("timeouts must be non-zero".to_string()));
        }

        if t.snapshot_secs >= t.establish_secs {
            return Err(Error::InvalidConfig(format!(
                "snapshot_secs ({}) must be shorter than establish_secs ({})",
                t.snapshot_secs, t.establish_secs
            )));
        }

        if self.frame_queue_depth == 0 || self.packet_queue_depth == 0 {
            return Err(Error::InvalidConfig("queue depths must be non-zero".to_string()));
        }

        if self.mtu < 188 {
            return Err(Error::InvalidConfig(format!("mtu must be >= 188, got {}", self.mtu)));
        }

        if self.transcoder.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("transcoder.path is empty".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.mtu, 1316);
        assert!(config.timeouts.snapshot() < config.timeouts.establish());
    }

    #[test]
    fn test_snapshot_must_be_shorter_than_establish() {
        let mut config = EngineConfig::default();
        config.timeouts.snapshot_secs = config.timeouts.establish_secs;
        let err = assert_err!(config.validate());
        assert!(err.is_config_error());
    }

    #[test]
    fn test_invalid_api_base() {
        let config = EngineConfig {
            api_base_url: "ftp://nope".to_string(),
            ..Default::default()
        };
        assert_err!(config.validate());
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let config = EngineConfig {
            frame_queue_depth: 0,
            ..Default::default()
        };
        assert_err!(config.validate());
    }

    #[test]
    fn test_from_toml_partial() {
        let text = r#"
            api_base_url = "http://127.0.0.1:9000"
            snapshot_ttl_secs = 5

            [transcoder]
            path = "/usr/local/bin/ffmpeg"

            [timeouts]
            establish_secs = 8
            snapshot_secs = 3
        "#;
        let config = assert_ok!(EngineConfig::from_toml_str(text));
        assert_eq!(config.api_base_url, "http://127.0.0.1:9000");
        assert_eq!(config.snapshot_ttl(), Duration::from_secs(5));
        assert_eq!(config.transcoder.path, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(config.transcoder.video_encoder, "libx264");
        assert_eq!(config.timeouts.establish(), Duration::from_secs(8));
        assert_eq!(config.timeouts.first_output_secs, 15);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let text = r#"
            [timeouts]
            establish_secs = 5
            snapshot_secs = 9
        "#;
        assert_err!(EngineConfig::from_toml_str(text));
    }
}
