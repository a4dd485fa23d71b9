mod error;
mod instance;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use instance::{InstanceConfig, ProtocolConfig, ReplicationConfig, SubscriptionConfig};
pub use validation::{
    to_context_config, to_server_capabilities, to_startup_params, to_subscriptions,
    validate_config,
};
