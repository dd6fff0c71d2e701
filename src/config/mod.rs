pub mod paths;
pub mod settings;

pub use settings::{
    HostKeyPolicy, LogFormat, LoggingSettings, PoolSettings, Settings, SshSettings,
    TransferSettings,
};
