use thiserror::Error;

/// Errors that can occur when parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("max_workers must be at least 1")]
    NoWorkers,

    #[error("naptime_secs must be at least 1")]
    InvalidNaptime,

    #[error("stats_max_entries must be -1 or a non-negative count, got {0}")]
    InvalidStatsMaxEntries(i64),

    #[error("invalid protocol version range {min}..={max}")]
    InvalidProtoRange { min: u32, max: u32 },

    #[error("invalid protocol format '{value}': expected one of native, json")]
    InvalidProtoFormat { value: String },

    #[error("subscription name must not be empty (id {id})")]
    EmptySubscriptionName { id: u32 },

    #[error("duplicate subscription {field} '{value}'")]
    DuplicateSubscription { field: &'static str, value: String },

    #[error("invalid sync table '{value}': expected schema.table")]
    InvalidSyncTable { value: String },

    #[error("invalid replay_stop_lsn '{value}' for subscription '{subscription}'")]
    InvalidStopLsn { subscription: String, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
