pub mod settings;

pub use settings::{
    GovernanceConfig, LinksConfig, LoggingConfig, ProviderConfig, ServerConfig, Settings,
    StoreConfig, UsageLoggerConfig,
};
