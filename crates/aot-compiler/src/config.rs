//! Service configuration.
//!
//! Layered from built-in defaults, an optional TOML file, and
//! `AOT_COMPILER__SECTION__KEY` environment overrides.
//!
//! ```toml
//! [service]
//! socket_path = "/run/aot_compiler/aot_compiler.sock"
//! unload_delay_secs = 180
//!
//! [compiler]
//! dynamic_compiler = "/system/bin/ark_aot_compiler"
//! static_compiler = "/system/bin/ark_aot"
//! boot_path_manifest = "/system/framework/bootpath.json"
//!
//! [admission]
//! thermal_pause_level = 2
//! ```

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_NAME: &str = "aot-compiler";
const ENV_PREFIX: &str = "AOT_COMPILER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub service: ServiceConfig,
    pub compiler: CompilerConfig,
    pub admission: AdmissionConfig,
    pub signing: SigningConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit JSON log lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// IPC endpoint and lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    /// Idle time after the last call before the service unloads itself.
    pub unload_delay_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/aot_compiler/aot_compiler.sock"),
            unload_delay_secs: 180,
        }
    }
}

impl ServiceConfig {
    pub fn unload_delay(&self) -> Duration {
        Duration::from_secs(self.unload_delay_secs)
    }
}

/// Compiler executables and device-sourced compiler flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Compiler for dynamic (ArkTS/JS) bytecode.
    pub dynamic_compiler: PathBuf,
    /// Compiler for static (ETS) bytecode.
    pub static_compiler: PathBuf,
    /// JSON manifest with the static runtime's boot class path.
    pub boot_path_manifest: PathBuf,
    /// Forwarded as `--compiler-an-file-max-size` when set.
    pub an_file_max_size: Option<String>,
    /// Forwarded as `--compiler-enable-aot-code-comment=true` when set.
    pub enable_code_comment: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            dynamic_compiler: PathBuf::from("/system/bin/ark_aot_compiler"),
            static_compiler: PathBuf::from("/system/bin/ark_aot"),
            boot_path_manifest: PathBuf::from("/system/framework/bootpath.json"),
            an_file_max_size: None,
            enable_code_comment: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Thermal level at or above which new compiles are refused.
    pub thermal_pause_level: i32,
    pub power_disconnected_cooldown_secs: u64,
    pub screen_on_cooldown_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            thermal_pause_level: 2,
            power_disconnected_cooldown_secs: 40,
            screen_on_cooldown_secs: 60,
        }
    }
}

impl AdmissionConfig {
    pub fn power_disconnected_cooldown(&self) -> Duration {
        Duration::from_secs(self.power_disconnected_cooldown_secs)
    }

    pub fn screen_on_cooldown(&self) -> Duration {
        Duration::from_secs(self.screen_on_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub enabled: bool,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Settings used by processes talking to the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long to wait for on-demand activation.
    pub activation_timeout_secs: u64,
    /// Command that asks the platform to start the service.
    pub activation_command: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            activation_timeout_secs: 6,
            activation_command: vec![
                "systemctl".to_string(),
                "start".to_string(),
                "aot-compiler.service".to_string(),
            ],
        }
    }
}

impl ClientConfig {
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from `path`, or from the default location when
    /// `None`. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };

        let built = Config::builder()
            .add_source(
                File::from(path.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        let mut config: AppConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;
        config.expand_paths()?;
        Ok(config)
    }

    fn expand_paths(&mut self) -> Result<()> {
        self.service.socket_path = expand_path(&self.service.socket_path)?;
        self.compiler.dynamic_compiler = expand_path(&self.compiler.dynamic_compiler)?;
        self.compiler.static_compiler = expand_path(&self.compiler.static_compiler)?;
        self.compiler.boot_path_manifest = expand_path(&self.compiler.boot_path_manifest)?;
        Ok(())
    }

    /// Write the default configuration to `path`, creating parent directories.
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {parent:?}"))?;
        }

        let toml = toml::to_string_pretty(&AppConfig::default())
            .context("serializing default config to TOML")?;
        let body = format!(
            "# Configuration for {APP_NAME}\n# File: {}\n\n{toml}",
            path.display()
        );
        fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("unable to determine config directory")?;
    Ok(dir.join(APP_NAME).join("config.toml"))
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let Some(text) = path.to_str() else {
        return Ok(path.to_path_buf());
    };
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.as_ref()))
}
