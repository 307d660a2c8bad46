// THEORY:
// All tunables of the service live in one plain-data `ServerConfig`. Two knobs
// that are easy to confuse are kept apart on purpose: `strategy` decides how
// many *connections* run at once, `pipeline.partitions` decides how many row
// ranges one *filter call* is split into.
//
// The binary reads its configuration from `KR_*` environment variables.
// `from_lookup` takes the variable source as a closure so tests never touch the
// process environment.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use kernel_relay::PipelineConfig;

use crate::protocol::{DEFAULT_MAX_PAYLOAD, ProtocolKind};

const DEFAULT_BIND: &str = "127.0.0.1:9000";
const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// What the bounded pool does with a connection when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Stop accepting until a slot frees.
    Block,
    /// Answer with a "server busy" error and close.
    Reject,
}

impl FromStr for Admission {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Admission::Block),
            "reject" => Ok(Admission::Reject),
            other => Err(format!("unknown admission policy {other:?} (expected `block` or `reject`)")),
        }
    }
}

/// How accepted connections are scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// One task per connection, no limit.
    Unbounded,
    /// A fixed pool of workers fed by a bounded queue.
    Bounded {
        workers: usize,
        queue_capacity: usize,
        admission: Admission,
    },
}

impl Default for DispatchStrategy {
    fn default() -> Self {
        DispatchStrategy::Bounded {
            workers: default_workers(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            admission: Admission::Block,
        }
    }
}

/// Configuration for one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to. Port 0 picks a free port.
    pub bind_addr: String,
    pub protocol: ProtocolKind,
    pub strategy: DispatchStrategy,
    pub pipeline: PipelineConfig,
    /// Largest binary payload accepted from a client.
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND.to_string(),
            protocol: ProtocolKind::Binary,
            strategy: DispatchStrategy::default(),
            pipeline: PipelineConfig::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any `KR_*` variable source. Unset variables keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ServerConfig::default();

        let bind_addr = lookup("KR_BIND").unwrap_or(defaults.bind_addr);
        let protocol = parse_var(&lookup, "KR_PROTOCOL", defaults.protocol)?;
        let partitions = positive(parse_var(&lookup, "KR_PARTITIONS", defaults.pipeline.partitions)?, "KR_PARTITIONS")?;
        let max_payload_bytes = parse_var(&lookup, "KR_MAX_PAYLOAD", defaults.max_payload_bytes)?;

        let strategy = match lookup("KR_STRATEGY").as_deref().map(str::trim) {
            None | Some("bounded") => DispatchStrategy::Bounded {
                workers: positive(parse_var(&lookup, "KR_WORKERS", default_workers())?, "KR_WORKERS")?,
                queue_capacity: positive(
                    parse_var(&lookup, "KR_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
                    "KR_QUEUE_CAPACITY",
                )?,
                admission: parse_var(&lookup, "KR_ADMISSION", Admission::Block)?,
            },
            Some("unbounded") => DispatchStrategy::Unbounded,
            Some(other) => bail!("KR_STRATEGY: unknown strategy {other:?} (expected `bounded` or `unbounded`)"),
        };

        Ok(Self {
            bind_addr,
            protocol,
            strategy,
            pipeline: PipelineConfig { partitions },
            max_payload_bytes,
        })
    }
}

fn default_workers() -> usize {
    num_cpus::get().max(1)
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow!("{err}"))
            .with_context(|| format!("invalid value {raw:?} for {key}")),
    }
}

fn positive(value: usize, key: &str) -> Result<usize> {
    if value == 0 {
        bail!("{key} must be at least 1");
    }
    Ok(value)
}
