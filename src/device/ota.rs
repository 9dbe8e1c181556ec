//! OTA backend: version check, activation, firmware and asset downloads

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the OTA backend
#[derive(Debug, Error)]
pub enum OtaError {
    /// The server has not confirmed yet; poll again shortly
    #[error("request timed out")]
    Timeout,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response: {0}")]
    Invalid(String),
}

/// A firmware build offered by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub version: String,
    pub url: String,
}

/// Pending activation handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationInfo {
    /// Code the user types into the companion app
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    /// Server challenge that must be answered by `activate`
    #[serde(default)]
    pub challenge: Option<String>,
}

/// Result of a successful version check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    /// Newer firmware, if any
    pub firmware: Option<FirmwareInfo>,
    pub activation: Option<ActivationInfo>,
    pub has_server_time: bool,
}

impl VersionInfo {
    pub fn needs_activation(&self) -> bool {
        self.activation
            .as_ref()
            .is_some_and(|a| a.code.is_some() || a.challenge.is_some())
    }
}

/// Progress callback: `(percent, bytes_per_second)`
pub type ProgressFn<'a> = &'a mut dyn FnMut(u8, usize);

pub trait Ota: Send + Sync {
    fn current_version(&self) -> String;
    fn check_version_url(&self) -> String;
    fn check_version(&self) -> Result<VersionInfo, OtaError>;
    fn mark_current_version_valid(&self);
    /// Answer the activation challenge; `Err(Timeout)` means "not yet"
    fn activate(&self, activation: &ActivationInfo) -> Result<(), OtaError>;
    fn upgrade(&self, url: &str, progress: ProgressFn<'_>) -> Result<(), OtaError>;
    fn download_assets(&self, url: &str, progress: ProgressFn<'_>) -> Result<(), OtaError>;
}

#[derive(Debug, Deserialize)]
struct CheckVersionResponse {
    #[serde(default)]
    firmware: Option<FirmwareInfo>,
    #[serde(default)]
    activation: Option<ActivationInfo>,
    #[serde(default)]
    server_time: Option<serde_json::Value>,
}

/// OTA backend speaking JSON over HTTP
pub struct HttpOta {
    client: reqwest::blocking::Client,
    url: String,
    current_version: String,
    download_dir: PathBuf,
}

impl HttpOta {
    pub fn new(url: impl Into<String>, download_dir: PathBuf) -> Result<Self, OtaError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("voxcore/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            download_dir,
        })
    }

    fn download(&self, url: &str, file_name: &str, progress: ProgressFn<'_>) -> Result<(), OtaError> {
        let mut response = self.client.get(url).timeout(Duration::from_secs(600)).send()?;
        if !response.status().is_success() {
            return Err(OtaError::Status(response.status().as_u16()));
        }

        let total = response.content_length().unwrap_or(0);
        let path = self.download_dir.join(file_name);
        let mut file = File::create(&path)?;
        let mut buf = vec![0u8; 16 * 1024];
        let mut written: u64 = 0;
        let mut window_bytes = 0usize;
        let mut window_start = Instant::now();

        loop {
            let n = response.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            written += n as u64;
            window_bytes += n;

            if window_start.elapsed() >= Duration::from_secs(1) {
                let percent = if total > 0 { (written * 100 / total).min(100) as u8 } else { 0 };
                progress(percent, window_bytes);
                window_bytes = 0;
                window_start = Instant::now();
            }
        }
        file.flush()?;

        if total > 0 && written != total {
            return Err(OtaError::Invalid(format!(
                "download truncated: {written} of {total} bytes"
            )));
        }
        progress(100, window_bytes);
        info!(?path, bytes = written, "download complete");
        Ok(())
    }
}

impl Ota for HttpOta {
    fn current_version(&self) -> String {
        self.current_version.clone()
    }

    fn check_version_url(&self) -> String {
        self.url.clone()
    }

    fn check_version(&self) -> Result<VersionInfo, OtaError> {
        let body = json!({ "application": { "version": self.current_version } });
        let response = self.client.post(&self.url).json(&body).send()?;
        if !response.status().is_success() {
            return Err(OtaError::Status(response.status().as_u16()));
        }
        let parsed: CheckVersionResponse = response.json()?;
        debug!(?parsed, "version check response");

        let firmware = parsed
            .firmware
            .filter(|fw| !fw.url.is_empty() && fw.version != self.current_version);
        Ok(VersionInfo {
            firmware,
            activation: parsed.activation,
            has_server_time: parsed.server_time.is_some(),
        })
    }

    fn mark_current_version_valid(&self) {
        info!(version = %self.current_version, "current firmware marked valid");
    }

    fn activate(&self, activation: &ActivationInfo) -> Result<(), OtaError> {
        let url = format!("{}/activate", self.url.trim_end_matches('/'));
        let body = json!({ "challenge": activation.challenge });
        let response = self.client.post(url).json(&body).send()?;
        match response.status().as_u16() {
            200 => Ok(()),
            202 => Err(OtaError::Timeout),
            status => Err(OtaError::Status(status)),
        }
    }

    fn upgrade(&self, url: &str, progress: ProgressFn<'_>) -> Result<(), OtaError> {
        self.download(url, "firmware.bin", progress)
    }

    fn download_assets(&self, url: &str, progress: ProgressFn<'_>) -> Result<(), OtaError> {
        self.download(url, "assets.bin", progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_version_response_parses_sections() {
        let raw = r#"{
            "firmware": {"version": "2.0.0", "url": "http://ota/fw.bin"},
            "activation": {"code": "123456", "message": "Enter code"},
            "server_time": {"timestamp": 1700000000000}
        }"#;
        let parsed: CheckVersionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.firmware.unwrap().version, "2.0.0");
        let activation = parsed.activation.unwrap();
        assert_eq!(activation.code.as_deref(), Some("123456"));
        assert!(activation.challenge.is_none());
        assert!(parsed.server_time.is_some());
    }

    #[test]
    fn test_needs_activation() {
        let mut info = VersionInfo::default();
        assert!(!info.needs_activation());
        info.activation = Some(ActivationInfo::default());
        assert!(!info.needs_activation());
        info.activation = Some(ActivationInfo {
            challenge: Some("abc".into()),
            ..ActivationInfo::default()
        });
        assert!(info.needs_activation());
    }
}
