//! CLI command implementations

mod config;
mod connect;

pub use config::{cmd_config_init, cmd_config_show};
pub use connect::cmd_connect;
