use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sfulink_channel::ChannelConfig;

use crate::error::{Result, WorkerError};

/// Verbosity of the worker's own logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Warn,
    Error,
    None,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::None => "none",
        }
    }
}

/// Worker subsystems whose debug output can be enabled individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTag {
    Info,
    Ice,
    Dtls,
    Rtp,
    Srtp,
    Rtcp,
    Rtx,
    Bwe,
    Score,
    Simulcast,
    Svc,
    Sctp,
    Message,
}

impl LogTag {
    pub const ALL: [LogTag; 13] = [
        LogTag::Info,
        LogTag::Ice,
        LogTag::Dtls,
        LogTag::Rtp,
        LogTag::Srtp,
        LogTag::Rtcp,
        LogTag::Rtx,
        LogTag::Bwe,
        LogTag::Score,
        LogTag::Simulcast,
        LogTag::Svc,
        LogTag::Sctp,
        LogTag::Message,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogTag::Info => "info",
            LogTag::Ice => "ice",
            LogTag::Dtls => "dtls",
            LogTag::Rtp => "rtp",
            LogTag::Srtp => "srtp",
            LogTag::Rtcp => "rtcp",
            LogTag::Rtx => "rtx",
            LogTag::Bwe => "bwe",
            LogTag::Score => "score",
            LogTag::Simulcast => "simulcast",
            LogTag::Svc => "svc",
            LogTag::Sctp => "sctp",
            LogTag::Message => "message",
        }
    }
}

/// Settings handed to every worker on its command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    pub log_level: Option<LogLevel>,
    pub log_tags: Vec<LogTag>,
    pub rtc_min_port: Option<u16>,
    pub rtc_max_port: Option<u16>,
    pub dtls_certificate_file: Option<String>,
    pub dtls_private_key_file: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            log_level: Some(LogLevel::Warn),
            log_tags: LogTag::ALL.to_vec(),
            rtc_min_port: Some(10000),
            rtc_max_port: Some(59999),
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

impl WorkerSettings {
    /// Render the settings as worker command-line arguments.
    ///
    /// Unset values and blank file paths are left out.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(4 + self.log_tags.len());
        if let Some(level) = self.log_level {
            args.push(format!("--logLevel={}", level.as_str()));
        }
        for tag in &self.log_tags {
            args.push(format!("--logTag={}", tag.as_str()));
        }
        if let Some(port) = self.rtc_min_port {
            args.push(format!("--rtcMinPort={port}"));
        }
        if let Some(port) = self.rtc_max_port {
            args.push(format!("--rtcMaxPort={port}"));
        }
        if let Some(file) = non_blank(&self.dtls_certificate_file) {
            args.push(format!("--dtlsCertificateFile={file}"));
        }
        if let Some(file) = non_blank(&self.dtls_private_key_file) {
            args.push(format!("--dtlsPrivateKeyFile={file}"));
        }
        args
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.rtc_min_port, self.rtc_max_port) {
            if min > max {
                return Err(WorkerError::Config(format!(
                    "rtcMinPort ({min}) is greater than rtcMaxPort ({max})"
                )));
            }
        }
        Ok(())
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Which backend runs the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A child process reached over inherited socket descriptors.
    #[default]
    Process,
    /// A native entry point run on a thread of this process.
    Native,
}

/// How workers are launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerStartup {
    pub worker_path: PathBuf,
    pub mediasoup_version: String,
    /// `0` starts one worker per available CPU.
    pub number_of_workers: usize,
    pub backend: BackendKind,
}

impl Default for WorkerStartup {
    fn default() -> Self {
        Self {
            worker_path: PathBuf::from("mediasoup-worker"),
            mediasoup_version: "0.0.1".to_string(),
            number_of_workers: 0,
            backend: BackendKind::Process,
        }
    }
}

impl WorkerStartup {
    /// Number of workers to start, resolving `0` to the CPU count.
    pub fn worker_count(&self) -> usize {
        if self.number_of_workers > 0 {
            return self.number_of_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Request timeouts, in milliseconds so they read well in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelTimeouts {
    pub base_timeout_ms: u64,
    pub timeout_per_pending_ms: u64,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        let config = ChannelConfig::default();
        Self {
            base_timeout_ms: duration_ms(config.base_timeout),
            timeout_per_pending_ms: duration_ms(config.timeout_per_pending),
        }
    }
}

impl ChannelTimeouts {
    pub fn to_channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            base_timeout: Duration::from_millis(self.base_timeout_ms),
            timeout_per_pending: Duration::from_millis(self.timeout_per_pending_ms),
            ..ChannelConfig::default()
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Everything a [`WorkerManager`](crate::WorkerManager) needs to start workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
    pub startup: WorkerStartup,
    pub worker_settings: WorkerSettings,
    pub channel: ChannelTimeouts,
}

impl ManagerConfig {
    /// Load and validate a JSON config document. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: ManagerConfig = serde_json::from_str(&text)
            .map_err(|err| WorkerError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.worker_settings.validate()?;
        if self.startup.mediasoup_version.trim().is_empty() {
            return Err(WorkerError::Config("mediasoupVersion is empty".into()));
        }
        Ok(())
    }
}
