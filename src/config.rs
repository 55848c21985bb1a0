//! Configuration management for rv32-emu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (RV32_EMU_MEMORY_SIZE, RV32_EMU_CWD)
//! 2. Project-local config file (`./rv32-emu.toml`)
//! 3. User config file (`~/.config/rv32-emu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # rv32-emu.toml
//!
//! # Guest memory capacity in bytes (default: 1 MiB)
//! memory_size = 1048576
//!
//! # Initial guest working directory (default: the ELF file's directory)
//! initial_cwd = "/srv/guest"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::emu::memory::DEFAULT_CAPACITY;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// rv32-emu configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Guest memory capacity in bytes.
    pub memory_size: Option<usize>,

    /// Initial guest working directory.
    /// Overrides the default of the ELF file's directory.
    pub initial_cwd: Option<String>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `rv32-emu.toml`
    /// 3. User config `~/.config/rv32-emu/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load user config first (lowest priority of file configs)
        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        // Load project-local config (higher priority)
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        // Environment variables override everything
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Guest memory capacity, with fallback to the 1 MiB default.
    pub fn memory_size(&self) -> usize {
        self.memory_size.unwrap_or(DEFAULT_CAPACITY)
    }

    /// Load user configuration from ~/.config/rv32-emu/config.toml
    fn load_user_config() -> Option<Self> {
        let config_dir = dirs::config_dir()?;
        let config_path = config_dir.join("rv32-emu").join("config.toml");
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./rv32-emu.toml
    fn load_local_config() -> Option<Self> {
        Self::load_from_file(Path::new("rv32-emu.toml"))
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.memory_size.is_some() {
            self.memory_size = other.memory_size;
        }
        if other.initial_cwd.is_some() {
            self.initial_cwd = other.initial_cwd;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("RV32_EMU_MEMORY_SIZE") {
            match size.parse() {
                Ok(size) => {
                    log::info!("Using RV32_EMU_MEMORY_SIZE from environment: {}", size);
                    self.memory_size = Some(size);
                }
                Err(e) => {
                    log::warn!("Ignoring bad RV32_EMU_MEMORY_SIZE {:?}: {}", size, e);
                }
            }
        }
        if let Ok(cwd) = std::env::var("RV32_EMU_CWD") {
            log::info!("Using RV32_EMU_CWD from environment: {}", cwd);
            self.initial_cwd = Some(cwd);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("rv32-emu").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# rv32-emu configuration
# Place this file at ~/.config/rv32-emu/config.toml or ./rv32-emu.toml

# Guest memory capacity in bytes (default: 1 MiB)
# memory_size = 1048576

# Initial guest working directory
# (default: the directory of the ELF file being run)
# initial_cwd = "/srv/guest"
"#
        .to_string()
    }
}
