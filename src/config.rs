//! Runtime configuration for the bridge and the worker.
//!
//! Both binaries read their settings from environment variables. Parsing goes
//! through a lookup function so tests can supply values without touching the
//! process environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::ipc::{ChannelConfig, MAX_MESSAGE_SIZE};

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Name of the worker binary shipped alongside the bridge.
const WORKER_BINARY: &str = "tool-worker";

const DEFAULT_WEATHER_URL: &str = "https://api.openweathermap.org";
const DEFAULT_WIKI_URL: &str = "https://en.wikipedia.org";
const DEFAULT_EXCHANGE_URL: &str = "https://open.exchangerate-api.com";

/// Program and arguments used to start the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Split a whitespace-separated command line. Returns `None` when empty.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: PathBuf::from(program),
            args: parts.map(str::to_string).collect(),
        })
    }

    /// The `tool-worker` binary next to the running executable, falling back
    /// to a `PATH` lookup.
    pub fn bundled() -> Self {
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
            .filter(|path| path.exists());

        Self::new(sibling.unwrap_or_else(|| PathBuf::from(WORKER_BINARY)))
    }
}

impl std::fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Settings for the `toolbridge` binary.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the HTTP endpoint listens on.
    pub addr: SocketAddr,
    pub worker: WorkerCommand,
    pub channel: ChannelConfig,
}

impl BridgeConfig {
    /// Read configuration from the process environment.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TOOLBRIDGE_HOST` | `127.0.0.1` |
    /// | `TOOLBRIDGE_PORT` | `4000` |
    /// | `TOOLBRIDGE_WORKER` | bundled `tool-worker` |
    /// | `TOOLBRIDGE_TIMEOUT_MS` | `10000` |
    /// | `TOOLBRIDGE_MAX_FRAME_BYTES` | 100 MiB |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host: IpAddr = match lookup("TOOLBRIDGE_HOST") {
            Some(host) => host
                .parse()
                .with_context(|| format!("Invalid TOOLBRIDGE_HOST: {}", host))?,
            None => IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        let port = parse_number(&lookup, "TOOLBRIDGE_PORT")?.unwrap_or(DEFAULT_PORT);

        let worker = match lookup("TOOLBRIDGE_WORKER") {
            Some(command_line) => WorkerCommand::parse(&command_line)
                .ok_or_else(|| anyhow!("TOOLBRIDGE_WORKER is set but empty"))?,
            None => WorkerCommand::bundled(),
        };

        let timeout_ms =
            parse_number(&lookup, "TOOLBRIDGE_TIMEOUT_MS")?.unwrap_or(DEFAULT_TIMEOUT_MS);
        if timeout_ms == 0 {
            return Err(anyhow!("TOOLBRIDGE_TIMEOUT_MS must be greater than zero"));
        }
        let max_message_size =
            parse_number(&lookup, "TOOLBRIDGE_MAX_FRAME_BYTES")?.unwrap_or(MAX_MESSAGE_SIZE);

        Ok(Self {
            addr: SocketAddr::new(host, port),
            worker,
            channel: ChannelConfig {
                timeout: Duration::from_millis(timeout_ms),
                max_message_size,
            },
        })
    }
}

/// Settings for the `tool-worker` binary.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// OpenWeatherMap API key (`WEATHER_API_KEY`).
    pub weather_api_key: Option<String>,
    pub weather_base_url: Url,
    pub wiki_base_url: Url,
    pub exchange_base_url: Url,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            weather_api_key: None,
            weather_base_url: Url::parse(DEFAULT_WEATHER_URL).expect("valid default URL"),
            wiki_base_url: Url::parse(DEFAULT_WIKI_URL).expect("valid default URL"),
            exchange_base_url: Url::parse(DEFAULT_EXCHANGE_URL).expect("valid default URL"),
        }
    }
}

impl WorkerConfig {
    /// Read configuration from the process environment.
    ///
    /// `WEATHER_API_KEY` enables the weather tool; `TOOLBRIDGE_WEATHER_URL`,
    /// `TOOLBRIDGE_WIKI_URL` and `TOOLBRIDGE_EXCHANGE_URL` override the
    /// backend base URLs.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            weather_api_key: lookup("WEATHER_API_KEY").filter(|key| !key.trim().is_empty()),
            weather_base_url: parse_url(&lookup, "TOOLBRIDGE_WEATHER_URL")?
                .unwrap_or(defaults.weather_base_url),
            wiki_base_url: parse_url(&lookup, "TOOLBRIDGE_WIKI_URL")?
                .unwrap_or(defaults.wiki_base_url),
            exchange_base_url: parse_url(&lookup, "TOOLBRIDGE_EXCHANGE_URL")?
                .unwrap_or(defaults.exchange_base_url),
        })
    }
}

fn parse_number<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", key, value))
        })
        .transpose()
}

fn parse_url<F>(lookup: &F, key: &str) -> Result<Option<Url>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| Url::parse(&value).with_context(|| format!("Invalid {}: {}", key, value)))
        .transpose()
}
