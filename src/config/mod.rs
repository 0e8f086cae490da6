//! Configuration management.

mod daemon;
mod xdg;

pub use daemon::{ConfigError, DaemonConfig, RelayConfig};
pub use xdg::XdgDirs;
