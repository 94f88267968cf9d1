// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::errors::NodeError;
use event_buffer::store::DEFAULT_FETCH_SIZE;
use event_buffer::DEFAULT_COMPONENT;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_COMPONENT: &str = "EVENT_BUFFER_COMPONENT";
pub const ENV_STORE_DIR: &str = "EVENT_BUFFER_STORE_DIR";
pub const ENV_FETCH_SIZE: &str = "EVENT_BUFFER_FETCH_SIZE";
pub const ENV_DRAIN_TIMEOUT_SECS: &str = "EVENT_BUFFER_DRAIN_TIMEOUT_SECS";
pub const ENV_COMPACT_ON_SHUTDOWN: &str = "EVENT_BUFFER_COMPACT_ON_SHUTDOWN";

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Consumer name; positions and buffers are scoped to it.
    pub component: String,
    /// `None` keeps every table in memory.
    pub store_dir: Option<PathBuf>,
    pub fetch_size: usize,
    pub drain_timeout: Duration,
    pub compact_on_shutdown: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            component: DEFAULT_COMPONENT.to_string(),
            store_dir: None,
            fetch_size: DEFAULT_FETCH_SIZE,
            drain_timeout: Duration::from_secs(30),
            compact_on_shutdown: false,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, NodeError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, NodeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(component) = lookup(ENV_COMPONENT) {
            let component = component.trim();
            if component.is_empty() {
                return Err(NodeError::Config(format!("{} must not be empty", ENV_COMPONENT)));
            }
            cfg.component = component.to_string();
        }
        if let Some(dir) = lookup(ENV_STORE_DIR).filter(|d| !d.trim().is_empty()) {
            cfg.store_dir = Some(PathBuf::from(dir));
        }
        if let Some(size) = parse::<usize>(&lookup, ENV_FETCH_SIZE)? {
            if size == 0 {
                return Err(NodeError::Config(format!("{} must be at least 1", ENV_FETCH_SIZE)));
            }
            cfg.fetch_size = size;
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_DRAIN_TIMEOUT_SECS)? {
            cfg.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = lookup(ENV_COMPACT_ON_SHUTDOWN) {
            cfg.compact_on_shutdown = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(NodeError::Config(format!(
                        "{}: expected a boolean, got {:?}",
                        ENV_COMPACT_ON_SHUTDOWN, other
                    )))
                }
            };
        }

        Ok(cfg)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, NodeError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| NodeError::Config(format!("{}={:?}: {}", name, raw, e))),
    }
}
