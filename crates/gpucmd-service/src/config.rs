use std::env;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest transfer buffer id a client may request explicitly.
pub const DEFAULT_MAX_ID_REQUEST: i32 = 100;

/// Hard ceiling for `max_id_request`; the handle table grows to this size.
pub const MAX_ID_REQUEST_LIMIT: i32 = 4096;

/// Maximum nesting of `Call` commands.
pub const MAX_STACK_DEPTH: usize = 32;

/// Commands executed per flush before the scheduler yields.
pub const DEFAULT_MAX_COMMANDS_PER_FLUSH: usize = 4096;

/// Largest bucket a client may allocate with `SetBucketSize`.
pub const DEFAULT_MAX_BUCKET_SIZE: usize = 64 << 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{name} = {value} is out of range (expected {expected})")]
    OutOfRange {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Upper bound (inclusive) for caller-requested transfer buffer ids.
    pub max_id_request: i32,
    /// Call stack depth at which further `Call`s are rejected.
    pub max_call_stack_depth: usize,
    /// Emit a `trace!` event for every dispatched command.
    pub trace_commands: bool,
    /// Commands drained per flush; the rest waits for the next flush.
    pub max_commands_per_flush: usize,
    /// Upper bound (inclusive) for a bucket size requested by the client.
    pub max_bucket_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_id_request: DEFAULT_MAX_ID_REQUEST,
            max_call_stack_depth: MAX_STACK_DEPTH,
            trace_commands: false,
            max_commands_per_flush: DEFAULT_MAX_COMMANDS_PER_FLUSH,
            max_bucket_size: DEFAULT_MAX_BUCKET_SIZE,
        }
    }
}

impl ServiceConfig {
    pub const ENV_MAX_ID_REQUEST: &'static str = "GPUCMD_MAX_ID_REQUEST";
    pub const ENV_MAX_CALL_STACK_DEPTH: &'static str = "GPUCMD_MAX_CALL_STACK_DEPTH";
    pub const ENV_TRACE_COMMANDS: &'static str = "GPUCMD_TRACE_COMMANDS";
    pub const ENV_MAX_COMMANDS_PER_FLUSH: &'static str = "GPUCMD_MAX_COMMANDS_PER_FLUSH";
    pub const ENV_MAX_BUCKET_SIZE: &'static str = "GPUCMD_MAX_BUCKET_SIZE";

    /// Defaults overlaid with any `GPUCMD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| env::var(name).ok())
    }

    /// Overlay values from `lookup` (keyed by environment variable name), then
    /// [`validate`](Self::validate) the result.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(Self::ENV_MAX_ID_REQUEST) {
            self.max_id_request = parse_value(Self::ENV_MAX_ID_REQUEST, value)?;
        }
        if let Some(value) = lookup(Self::ENV_MAX_CALL_STACK_DEPTH) {
            self.max_call_stack_depth = parse_value(Self::ENV_MAX_CALL_STACK_DEPTH, value)?;
        }
        if let Some(value) = lookup(Self::ENV_TRACE_COMMANDS) {
            self.trace_commands = match value.trim() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: Self::ENV_TRACE_COMMANDS,
                        value,
                    })
                }
            };
        }
        if let Some(value) = lookup(Self::ENV_MAX_COMMANDS_PER_FLUSH) {
            self.max_commands_per_flush = parse_value(Self::ENV_MAX_COMMANDS_PER_FLUSH, value)?;
        }
        if let Some(value) = lookup(Self::ENV_MAX_BUCKET_SIZE) {
            self.max_bucket_size = parse_value(Self::ENV_MAX_BUCKET_SIZE, value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_ID_REQUEST_LIMIT).contains(&self.max_id_request) {
            return Err(ConfigError::OutOfRange {
                name: "max_id_request",
                value: self.max_id_request.to_string(),
                expected: "1..=4096",
            });
        }
        if self.max_commands_per_flush == 0 {
            return Err(ConfigError::OutOfRange {
                name: "max_commands_per_flush",
                value: "0".to_string(),
                expected: "at least 1",
            });
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { name, value })
}
