//! CLI command implementations.

mod check;
mod config;
mod key;

pub use check::{run_check, CheckArgs};
pub use config::{run_config, ConfigArgs, ConfigCommand};
pub use key::{run_key, KeyArgs, KeyCommand};
