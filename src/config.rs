use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

pub const DEFAULT_NAMESPACE: &str = "examples/response";
const PROJECT_CONFIG_FILE: &str = "collectproxy.toml";
const HOME_CONFIG_DIR: &str = ".collectproxy";
const HOME_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Filesystem base directory of the example store.
    pub path: PathBuf,
    /// Key prefix under which examples live.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_owned()
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Loads configuration with default discovery: an explicit path wins,
    /// then `./collectproxy.toml`, then `~/.collectproxy/config.toml`.
    pub fn load(explicit_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_path(path)
                .with_context(|| format!("load config override {}", path.display()));
        }

        let project_path = PathBuf::from(PROJECT_CONFIG_FILE);
        if project_path.is_file() {
            return Self::from_path(&project_path)
                .with_context(|| format!("load project ./{PROJECT_CONFIG_FILE}"));
        }

        if let Some(home_path) = home_config_path()
            && home_path.is_file()
        {
            return Self::from_path(&home_path)
                .with_context(|| format!("load home config {}", home_path.display()));
        }

        anyhow::bail!(
            "no config found; create ./{PROJECT_CONFIG_FILE} or ~/{HOME_CONFIG_DIR}/{HOME_CONFIG_FILE}, or pass --config"
        )
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

fn home_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(HOME_CONFIG_DIR)
            .join(HOME_CONFIG_FILE),
    )
}
