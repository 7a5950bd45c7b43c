//! Farm and render-client configuration.
//!
//! Layering: defaults, then an optional JSON file, then environment
//! (`LDR_PORT`, `LDR_PASSWORD`, `LDR_LOW`, `LDR_HIGH`, `LDR_RENDERER`), then
//! command-line flags applied by the binary through the `with_*` builders.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::DEFAULT_PORT;
use crate::scheduler::Thresholds;

pub const DEFAULT_HTTP_PORT: u16 = 3105;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid thresholds: low {low} must not exceed high {high}, high must be at least 1")]
    InvalidThresholds { low: usize, high: usize },
    #[error("njobs must be at least 1")]
    ZeroNjobs,
    #[error("a password is required when accepting or connecting to remote workers")]
    MissingPassword,
    #[error("client needs either a server address or a listen address")]
    NoEndpoint,
}

/// Renderer program and its fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendererConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl RendererConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    /// TCP address for incoming render clients. None disables the listener.
    pub listen: Option<SocketAddr>,
    pub password: Option<String>,
    pub thresholds: Thresholds,
    /// Renderer for local workers. None disables local rendering.
    pub renderer: Option<RendererConfig>,
    /// Cap on concurrent local workers. None spawns on demand.
    pub local_workers: Option<usize>,
    /// Slots assigned to each remote client in `NowConnected`.
    pub client_njobs: u16,
    /// Retries after ConnectionLost before the task fails for good.
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    /// SIGTERM to SIGKILL escalation delay for local workers.
    #[serde(with = "duration_secs")]
    pub kill_grace: Duration,
    /// How long a remote worker may take to acknowledge a cancel.
    #[serde(with = "duration_secs")]
    pub cancel_grace: Duration,
    #[serde(with = "duration_secs")]
    pub terminate_grace: Duration,
    /// Render clients to connect out to at startup.
    pub connect: Vec<String>,
    /// Base directory for task input files.
    pub input_dir: PathBuf,
    /// Operator HTTP API address. None disables it.
    pub http: Option<SocketAddr>,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            listen: Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                DEFAULT_PORT,
            )),
            password: None,
            thresholds: Thresholds::default(),
            renderer: None,
            local_workers: None,
            client_njobs: 1,
            max_retries: DEFAULT_MAX_RETRIES,
            handshake_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(10),
            terminate_grace: Duration::from_secs(10),
            connect: Vec::new(),
            input_dir: PathBuf::from("."),
            http: None,
        }
    }
}

impl FarmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    /// Apply `LDR_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    pub fn apply_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(port) = parse_env::<u16>(&lookup, "LDR_PORT")? {
            let ip = self
                .listen
                .map(|addr| addr.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            self.listen = Some(SocketAddr::new(ip, port));
        }
        if let Some(password) = lookup("LDR_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(low) = parse_env::<usize>(&lookup, "LDR_LOW")? {
            self.thresholds.low = low;
        }
        if let Some(high) = parse_env::<usize>(&lookup, "LDR_HIGH")? {
            self.thresholds.high = high;
        }
        if let Some(program) = lookup("LDR_RENDERER") {
            self.renderer = Some(match self.renderer.take() {
                Some(r) => RendererConfig {
                    program: program.into(),
                    args: r.args,
                },
                None => RendererConfig::new(program),
            });
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;
        if self.client_njobs == 0 {
            return Err(ConfigError::ZeroNjobs);
        }
        let remote = self.listen.is_some() || !self.connect.is_empty();
        if remote && self.password.is_none() {
            return Err(ConfigError::MissingPassword);
        }
        Ok(())
    }

    /// True when local workers may be spawned.
    pub fn local_enabled(&self) -> bool {
        self.renderer.is_some() && self.local_workers != Some(0)
    }

    pub fn with_listen(mut self, listen: Option<SocketAddr>) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_renderer(mut self, renderer: RendererConfig) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_local_workers(mut self, limit: Option<usize>) -> Self {
        self.local_workers = limit;
        self
    }

    pub fn with_client_njobs(mut self, njobs: u16) -> Self {
        self.client_njobs = njobs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_connect(mut self, addrs: Vec<String>) -> Self {
        self.connect = addrs;
        self
    }

    pub fn with_input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = dir.into();
        self
    }

    pub fn with_http(mut self, addr: Option<SocketAddr>) -> Self {
        self.http = addr;
        self
    }
}

/// Render client (worker side) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server to connect to.
    pub server: Option<String>,
    /// Address to accept server connections on.
    pub listen: Option<SocketAddr>,
    pub password: String,
    pub renderer: Option<RendererConfig>,
    /// Input files are cached and outputs written here.
    pub work_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            listen: None,
            password: String::new(),
            renderer: None,
            work_dir: PathBuf::from("."),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    pub fn apply_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(port) = parse_env::<u16>(&lookup, "LDR_PORT")?
            && let Some(listen) = self.listen.as_mut()
        {
            listen.set_port(port);
        }
        if let Some(password) = lookup("LDR_PASSWORD") {
            self.password = password;
        }
        if let Some(program) = lookup("LDR_RENDERER") {
            let args = self.renderer.take().map(|r| r.args).unwrap_or_default();
            self.renderer = Some(RendererConfig::new(program).with_args(args));
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_none() && self.listen.is_none() {
            return Err(ConfigError::NoEndpoint);
        }
        Ok(())
    }

    pub fn with_server(mut self, addr: impl Into<String>) -> Self {
        self.server = Some(addr.into());
        self
    }

    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_renderer(mut self, renderer: RendererConfig) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        None => Ok(None),
    }
}

/// Serde helper: `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Serde helper: `Option<Duration>` as fractional seconds.
pub(crate) mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let config = FarmConfig::default();
        assert_eq!(config.listen.map(|a| a.port()), Some(DEFAULT_PORT));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.client_njobs, 1);
        assert!(!config.local_enabled());
    }

    #[test]
    fn file_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("farm.json");
        std::fs::write(
            &path,
            r#"{"password": "pw", "thresholds": {"low": 1, "high": 3}, "kill_grace": 0.5,
                "renderer": {"program": "/usr/bin/povray"}}"#,
        )
        .unwrap();

        let config = FarmConfig::from_file(&path).unwrap();
        assert_eq!(config.password.as_deref(), Some("pw"));
        assert_eq!(config.thresholds, Thresholds { low: 1, high: 3 });
        assert_eq!(config.kill_grace, Duration::from_millis(500));
        assert_eq!(config.terminate_grace, Duration::from_secs(10));
        assert!(config.local_enabled());
        config.validate().unwrap();
    }

    #[test]
    fn parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = FarmConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn env_overrides_file_values() {
        let config = FarmConfig::default()
            .with_password("file")
            .apply_env_from(env(&[
                ("LDR_PORT", "4000"),
                ("LDR_PASSWORD", "env"),
                ("LDR_LOW", "2"),
                ("LDR_HIGH", "6"),
                ("LDR_RENDERER", "/opt/render"),
            ]))
            .unwrap();

        assert_eq!(config.listen.map(|a| a.port()), Some(4000));
        assert_eq!(config.password.as_deref(), Some("env"));
        assert_eq!(config.thresholds, Thresholds { low: 2, high: 6 });
        assert_eq!(
            config.renderer.map(|r| r.program),
            Some(PathBuf::from("/opt/render"))
        );
    }

    #[test]
    fn env_rejects_garbage() {
        let err = FarmConfig::default()
            .apply_env_from(env(&[("LDR_HIGH", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "LDR_HIGH", .. }));
    }

    #[test]
    fn validate_rejects_inverted_thresholds() {
        let config = FarmConfig::default()
            .with_listen(None)
            .with_thresholds(Thresholds { low: 5, high: 2 });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidThresholds { low: 5, high: 2 })
        ));
    }

    #[test]
    fn validate_rejects_zero_njobs() {
        let config = FarmConfig::default()
            .with_listen(None)
            .with_client_njobs(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroNjobs)));
    }

    #[test]
    fn validate_requires_password_for_remote() {
        let config = FarmConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPassword)
        ));
        FarmConfig::default().with_listen(None).validate().unwrap();
    }

    #[test]
    fn client_env_and_validate() {
        let config = ClientConfig::new()
            .with_listen("127.0.0.1:3104".parse().unwrap())
            .apply_env_from(env(&[("LDR_PORT", "4100"), ("LDR_PASSWORD", "pw")]))
            .unwrap();
        assert_eq!(config.listen.map(|a| a.port()), Some(4100));
        assert_eq!(config.password, "pw");
        config.validate().unwrap();

        assert!(matches!(
            ClientConfig::new().validate(),
            Err(ConfigError::NoEndpoint)
        ));
    }
}
