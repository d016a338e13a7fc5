//! Configuration management for config.toml
//!
//! Configuration file: ~/.config/gui-bridge/config.toml (or platform equivalent)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub screen: ScreenConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Step budget and screenshot scaling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum capture/predict/execute iterations per run
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Longest side of the screenshot handed to the agent
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
}

/// Sleeps between steps, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Backoff after a failed capture, prediction or execution
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
    /// Pause when the agent asks to wait
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,
    #[serde(default = "default_pre_action_ms")]
    pub pre_action_ms: u64,
    #[serde(default = "default_post_action_ms")]
    pub post_action_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenConfig {
    /// Command template writing a PNG to `{path}`
    #[serde(default = "default_capture_command")]
    pub capture_command: String,
    /// Command template resizing `{path}` in place to `{width}`x`{height}`
    #[serde(default = "default_resize_command")]
    pub resize_command: Option<String>,
    /// Command printing the logical screen size as two numbers
    #[serde(default = "default_size_command")]
    pub size_command: Option<String>,
    /// Logical screen size, for displays whose captures are in device pixels
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputBackend {
    Auto,
    Xdotool,
    Cliclick,
}

impl std::str::FromStr for InputBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(InputBackend::Auto),
            "xdotool" => Ok(InputBackend::Xdotool),
            "cliclick" => Ok(InputBackend::Cliclick),
            other => anyhow::bail!("Unknown input backend: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_backend")]
    pub backend: InputBackend,
    /// Timeout for a single input command, in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

/// Defaults applied when an `init` message leaves fields out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_max_steps() -> usize {
    30
}

fn default_max_dimension() -> u32 {
    2400
}

fn default_retry_ms() -> u64 {
    500
}

fn default_wait_ms() -> u64 {
    1000
}

fn default_pre_action_ms() -> u64 {
    300
}

fn default_post_action_ms() -> u64 {
    700
}

fn default_capture_command() -> String {
    if cfg!(target_os = "macos") {
        "screencapture -x -t png {path}".to_string()
    } else {
        "import -window root {path}".to_string()
    }
}

fn default_resize_command() -> Option<String> {
    if cfg!(target_os = "macos") {
        Some("sips -z {height} {width} {path}".to_string())
    } else {
        Some("convert {path} -filter Lanczos -resize {width}x{height}! {path}".to_string())
    }
}

fn default_size_command() -> Option<String> {
    if cfg!(target_os = "macos") {
        Some(
            r#"osascript -l JavaScript -e 'ObjC.import("AppKit"); var f = $.NSScreen.mainScreen.frame; f.size.width + " " + f.size.height'"#
                .to_string(),
        )
    } else {
        Some("xdotool getdisplaygeometry".to_string())
    }
}

fn default_backend() -> InputBackend {
    InputBackend::Auto
}

fn default_command_timeout() -> u64 {
    10
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_dimension: default_max_dimension(),
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            retry_ms: default_retry_ms(),
            wait_ms: default_wait_ms(),
            pre_action_ms: default_pre_action_ms(),
            post_action_ms: default_post_action_ms(),
        }
    }
}

impl PacingConfig {
    /// No sleeping at all, for tests and dry runs
    pub fn immediate() -> Self {
        Self {
            retry_ms: 0,
            wait_ms: 0,
            pre_action_ms: 0,
            post_action_ms: 0,
        }
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn pre_action(&self) -> Duration {
        Duration::from_millis(self.pre_action_ms)
    }

    pub fn post_action(&self) -> Duration {
        Duration::from_millis(self.post_action_ms)
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            capture_command: default_capture_command(),
            resize_command: default_resize_command(),
            size_command: default_size_command(),
            width: None,
            height: None,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: default_model(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.as_ref().display()))
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("gui-bridge").join("config.toml"))
    }

    /// Write a commented default configuration file
    pub fn create_default(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists: {}", path.display());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let capture = toml_string(&default_capture_command());
        let resize = toml_string(&default_resize_command().unwrap_or_default());
        let size = toml_string(&default_size_command().unwrap_or_default());
        let content = format!(
            r#"# gui-bridge configuration

[run]
# Iterations per run before a timeout event is emitted
max_steps = 30

# Longest side, in pixels, of the screenshot handed to the agent
max_dimension = 2400

[pacing]
# Milliseconds
retry_ms = 500
wait_ms = 1000
pre_action_ms = 300
post_action_ms = 700

[screen]
capture_command = {capture}
resize_command = {resize}

# Prints the logical screen size; input coordinates use this space.
# Falls back to the capture's pixel size when unset or failing.
size_command = {size}

# Fixed logical screen size, skipping the size command
# width = 1440
# height = 900

[input]
# "auto", "xdotool" or "cliclick"
backend = "auto"
command_timeout_secs = 10

[agent]
default_provider = "openai"
default_model = "gpt-4o"
request_timeout_secs = 120
"#
        );

        fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

}

impl ScreenConfig {
    /// Fixed screen size, when both sides are set
    pub fn size_override(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        }
    }
}

/// Quote a value as a TOML basic string
fn toml_string(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.run.max_steps, 30);
        assert_eq!(config.run.max_dimension, 2400);
        assert_eq!(config.pacing.wait_ms, 1000);
        assert_eq!(config.pacing.wait(), Duration::from_secs(1));
        assert_eq!(config.input.backend, InputBackend::Auto);
        assert_eq!(config.agent.default_model, "gpt-4o");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[run]
max_steps = 5

[pacing]
retry_ms = 10

[screen]
capture_command = "grim {path}"
width = 1440
height = 900

[input]
backend = "xdotool"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.run.max_steps, 5);
        assert_eq!(config.run.max_dimension, 2400);
        assert_eq!(config.pacing.retry_ms, 10);
        assert_eq!(config.pacing.post_action_ms, 700);
        assert_eq!(config.screen.capture_command, "grim {path}");
        assert_eq!(config.screen.size_override(), Some((1440, 900)));
        assert!(config.screen.size_command.is_some());
        assert_eq!(config.input.backend, InputBackend::Xdotool);
    }

    #[test]
    fn test_create_default_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        Config::create_default(&path).unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.run.max_steps, 30);
        assert!(config.screen.capture_command.contains("{path}"));
        assert_eq!(config.screen.size_command, default_size_command());
        assert_eq!(config.screen.size_override(), None);

        assert!(Config::create_default(&path).is_err());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("CLICLICK".parse::<InputBackend>().unwrap(), InputBackend::Cliclick);
        assert!("robot".parse::<InputBackend>().is_err());
    }
}
