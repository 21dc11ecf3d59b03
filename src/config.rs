use crate::EmbedMode;
use log::{debug, trace};
use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_MAX_DIMENSION: u32 = 200;
pub const DEFAULT_QUALITY: u8 = 85;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Image settings from file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileImageConfig {
    pub max_dimension: Option<u32>,
    pub quality: Option<u8>,
    pub timeout: Option<u64>,
    pub user_agent: Option<String>,
}

/// Configuration loaded from file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub input: Option<String>,
    pub output: Option<String>,
    pub root: Option<String>,
    pub embed: Option<String>,
    pub strict: Option<bool>,
    #[serde(default)]
    pub image: FileImageConfig,
}

/// Resolved image materialization settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    /// Longest side allowed when a reference requests no size
    pub max_dimension: u32,
    /// JPEG re-encode quality (1-100)
    pub quality: u8,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            quality: DEFAULT_QUALITY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Resolved configuration with all sources merged
#[derive(Debug)]
pub struct Config {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub embed: EmbedMode,
    pub strict: bool,
    pub image: ImageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: PathBuf::from("-"),
            output: None,
            root: None,
            embed: EmbedMode::All,
            strict: false,
            image: ImageConfig::default(),
        }
    }
}

/// Get the XDG config directory ($XDG_CONFIG_HOME or ~/.config)
#[cfg(target_os = "macos")]
fn xdg_config_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| dirs::home_dir().map(|p| p.join(".config")))
}

/// Get the default config file path
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.toml"))
}

/// Get the default config directory
/// On macOS, checks ~/Library/Application Support/mdembed/ first, then $XDG_CONFIG_HOME/mdembed/
pub fn default_config_dir() -> Option<PathBuf> {
    let primary = dirs::config_local_dir().map(|p| p.join("mdembed"));

    #[cfg(target_os = "macos")]
    {
        if primary.as_ref().is_some_and(|p| p.exists()) {
            return primary;
        }
        let fallback = xdg_config_dir().map(|p| p.join("mdembed"));
        if fallback.as_ref().is_some_and(|p| p.exists()) {
            return fallback;
        }
        primary
    }

    #[cfg(not(target_os = "macos"))]
    {
        primary
    }
}

/// Load configuration from a TOML file
pub fn load_config_file(path: &PathBuf) -> Option<FileConfig> {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                debug!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                log::warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to read config file {:?}: {}", path, e);
            } else {
                trace!("No config file at {:?}", path);
            }
            None
        }
    }
}

/// Load a setting from environment variable
fn env_var(name: &str) -> Option<String> {
    let key = format!("MDEMBED_{}", name.to_uppercase());
    std::env::var(&key).ok().map(|v| {
        trace!("Found env var {}={}", key, v);
        v
    })
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_embed_mode(s: &str) -> Option<EmbedMode> {
    match s.to_lowercase().as_str() {
        "all" => Some(EmbedMode::All),
        "local" => Some(EmbedMode::Local),
        "remote" => Some(EmbedMode::Remote),
        "none" => Some(EmbedMode::None),
        _ => None,
    }
}

/// Clamp a JPEG quality into the range the encoder accepts
fn parse_quality(v: u8) -> u8 {
    v.clamp(1, 100)
}

/// CLI argument values for image settings
#[derive(Default)]
pub struct CliImageArgs {
    pub max_dimension: Option<u32>,
    pub quality: Option<u8>,
    pub timeout: Option<u64>,
}

/// CLI argument values (None means not specified)
#[derive(Default)]
pub struct CliArgs {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub embed: Option<EmbedMode>,
    pub strict: Option<bool>,
    pub image: CliImageArgs,
}

impl Config {
    /// Build configuration with precedence: CLI > env vars > config file > defaults
    #[allow(clippy::field_reassign_with_default)]
    pub fn build(cli: CliArgs, config_path: Option<PathBuf>) -> Self {
        let mut config = Config::default();

        let file_config = config_path
            .or_else(default_config_path)
            .and_then(|p| load_config_file(&p))
            .unwrap_or_default();

        // Config file
        if let Some(v) = file_config.input {
            config.input = PathBuf::from(v);
        }
        if let Some(v) = file_config.output {
            config.output = Some(PathBuf::from(v));
        }
        if let Some(v) = file_config.root {
            config.root = Some(PathBuf::from(v));
        }
        if let Some(v) = file_config.embed.and_then(|s| parse_embed_mode(&s)) {
            config.embed = v;
        }
        if let Some(v) = file_config.strict {
            config.strict = v;
        }
        if let Some(v) = file_config.image.max_dimension {
            config.image.max_dimension = v;
        }
        if let Some(v) = file_config.image.quality {
            config.image.quality = parse_quality(v);
        }
        if let Some(v) = file_config.image.timeout {
            config.image.timeout_secs = v;
        }
        if let Some(v) = file_config.image.user_agent {
            config.image.user_agent = v;
        }

        // Environment variables
        if let Some(v) = env_var("input") {
            config.input = PathBuf::from(v);
        }
        if let Some(v) = env_var("output") {
            config.output = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("root") {
            config.root = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("embed").and_then(|s| parse_embed_mode(&s)) {
            config.embed = v;
        }
        if let Some(v) = env_var("strict").and_then(|s| parse_bool(&s)) {
            config.strict = v;
        }
        if let Some(v) = env_var("max_dimension").and_then(|s| s.parse().ok()) {
            config.image.max_dimension = v;
        }
        if let Some(v) = env_var("quality").and_then(|s| s.parse().ok()) {
            config.image.quality = parse_quality(v);
        }
        if let Some(v) = env_var("timeout").and_then(|s| s.parse().ok()) {
            config.image.timeout_secs = v;
        }

        // CLI arguments
        if let Some(v) = cli.input {
            config.input = v;
        }
        if let Some(v) = cli.output {
            config.output = Some(v);
        }
        if let Some(v) = cli.root {
            config.root = Some(v);
        }
        if let Some(v) = cli.embed {
            config.embed = v;
        }
        if let Some(v) = cli.strict {
            config.strict = v;
        }
        if let Some(v) = cli.image.max_dimension {
            config.image.max_dimension = v;
        }
        if let Some(v) = cli.image.quality {
            config.image.quality = parse_quality(v);
        }
        if let Some(v) = cli.image.timeout {
            config.image.timeout_secs = v;
        }

        config
    }
}
