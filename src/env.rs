use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::messaging::{BusError, ConnectionId, Result};

pub const CONN_STRING: &str = "SB_CONN_STRING";
pub const NAMESPACE: &str = "SB_NAMESPACE";
pub const TOPIC_NAME: &str = "SB_TOPIC_NAME";
pub const SUBSCRIPTION_NAME: &str = "SB_SUBSCRIPTION_NAME";
pub const QUEUE_NAME: &str = "SB_QUEUE_NAME";
pub const PREFETCH_COUNT: &str = "SB_PREFETCH_COUNT";
pub const CONNECT_TIMEOUT_SECONDS: &str = "SB_CONNECT_TIMEOUT_SECONDS";
pub const DECLARE_TOPOLOGY: &str = "SB_DECLARE_TOPOLOGY";

#[derive(Debug, Clone)]
pub struct Settings {
    pub connection_string: String,
    pub namespace: Option<String>,
    pub topic_name: Option<String>,
    pub subscription_name: Option<String>,
    pub queue_name: Option<String>,
    pub prefetch_count: u16,
    pub connect_timeout_seconds: u64,
    pub declare_topology: bool,
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

impl Settings {
    /// Load from the process environment, reading `.env` first if present.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key/value source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let connection_string = get(CONN_STRING)
            .ok_or_else(|| BusError::configuration(format!("{} is not set", CONN_STRING)))?;

        Ok(Settings {
            connection_string,
            namespace: get(NAMESPACE),
            topic_name: get(TOPIC_NAME),
            subscription_name: get(SUBSCRIPTION_NAME),
            queue_name: get(QUEUE_NAME),
            prefetch_count: parse_or(PREFETCH_COUNT, get(PREFETCH_COUNT), default_prefetch_count())?,
            connect_timeout_seconds: parse_or(
                CONNECT_TIMEOUT_SECONDS,
                get(CONNECT_TIMEOUT_SECONDS),
                default_connect_timeout_seconds(),
            )?,
            declare_topology: parse_or(DECLARE_TOPOLOGY, get(DECLARE_TOPOLOGY), true)?,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Connection identifier, scoped to the namespace when one is set.
    pub fn connection_id(&self) -> Result<ConnectionId> {
        let id = ConnectionId::new(self.connection_string.clone());
        match &self.namespace {
            Some(namespace) => id.with_namespace(namespace),
            None => Ok(id),
        }
    }

    pub fn require_topic(&self) -> Result<&str> {
        require(TOPIC_NAME, self.topic_name.as_deref())
    }

    pub fn require_subscription(&self) -> Result<&str> {
        require(SUBSCRIPTION_NAME, self.subscription_name.as_deref())
    }

    pub fn require_queue(&self) -> Result<&str> {
        require(QUEUE_NAME, self.queue_name.as_deref())
    }
}

fn require<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str> {
    value.ok_or_else(|| BusError::configuration(format!("{} is not set", key)))
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|e| BusError::configuration(format!("{}={:?} is invalid: {}", key, raw, e))),
        None => Ok(default),
    }
}
