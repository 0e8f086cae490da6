//! XDG Base Directory support.

use std::path::PathBuf;

const APP: &str = "agentbus";

/// XDG directory paths for agentbus.
#[derive(Debug, Clone, PartialEq)]
pub struct XdgDirs {
    /// Config directory (~/.config/agentbus or XDG_CONFIG_HOME/agentbus)
    pub config: PathBuf,
    /// Data directory (~/.local/share/agentbus or XDG_DATA_HOME/agentbus)
    pub data: PathBuf,
    /// State directory (~/.local/state/agentbus or XDG_STATE_HOME/agentbus)
    pub state: PathBuf,
    /// Runtime directory for the socket (XDG_RUNTIME_DIR/agentbus, else state)
    pub runtime: PathBuf,
}

impl XdgDirs {
    /// Get XDG directories, respecting environment variables.
    pub fn new() -> Self {
        Self::from_env(|key| std::env::var(key).ok())
    }

    /// Resolve directories with a custom variable lookup.
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        let state = var("XDG_STATE_HOME")
            .unwrap_or_else(|| home.join(".local/state"))
            .join(APP);
        Self {
            config: var("XDG_CONFIG_HOME")
                .unwrap_or_else(|| home.join(".config"))
                .join(APP),
            data: var("XDG_DATA_HOME")
                .unwrap_or_else(|| home.join(".local/share"))
                .join(APP),
            runtime: var("XDG_RUNTIME_DIR")
                .map(|dir| dir.join(APP))
                .unwrap_or_else(|| state.clone()),
            state,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.json")
    }

    pub fn database(&self) -> PathBuf {
        self.data.join("bus.db")
    }

    pub fn socket(&self) -> PathBuf {
        self.runtime.join("agentbus.sock")
    }
}

impl Default for XdgDirs {
    fn default() -> Self {
        Self::new()
    }
}
