//! Screen size, scaling and capture

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::config::ScreenConfig;
use crate::process::{self, CommandTemplate};

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(15);

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for ScreenSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Shrink `size` so neither side exceeds `max_dim`, keeping the aspect ratio
///
/// Never upscales. Fractional pixels are truncated.
pub fn scale_screen_dimensions(size: ScreenSize, max_dim: u32) -> ScreenSize {
    if size.width == 0 || size.height == 0 {
        return size;
    }

    let max_dim = f64::from(max_dim);
    let factor = (max_dim / f64::from(size.width))
        .min(max_dim / f64::from(size.height))
        .min(1.0);

    ScreenSize {
        width: (f64::from(size.width) * factor) as u32,
        height: (f64::from(size.height) * factor) as u32,
    }
}

/// Width and height from a PNG's IHDR chunk
pub fn png_dimensions(bytes: &[u8]) -> Result<ScreenSize> {
    if bytes.len() < 24 || bytes[..8] != PNG_SIGNATURE {
        bail!("Not a PNG image");
    }
    if &bytes[12..16] != b"IHDR" {
        bail!("PNG is missing its IHDR header");
    }

    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);

    Ok(ScreenSize { width, height })
}

/// Screen size from the first two numbers a size command prints
///
/// Fractional sizes, as some platforms report in points, are truncated.
pub fn parse_size_output(output: &str) -> Result<ScreenSize> {
    let numbers: Vec<f64> = output
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter_map(|word| word.parse().ok())
        .take(2)
        .collect();

    let valid = 1.0..=f64::from(u32::MAX);
    match numbers[..] {
        [w, h] if valid.contains(&w) && valid.contains(&h) => {
            Ok(ScreenSize::new(w as u32, h as u32))
        }
        _ => bail!("Expected a width and height, got {:?}", output.trim()),
    }
}

fn optional_template(command: Option<&str>) -> Result<Option<CommandTemplate>> {
    match command {
        Some(cmd) if !cmd.trim().is_empty() => Ok(Some(CommandTemplate::parse(cmd)?)),
        _ => Ok(None),
    }
}

/// Source of screenshots
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// Full screen size, in the coordinate space input actions use
    async fn size(&self) -> Result<ScreenSize>;

    /// Capture the screen as PNG, resized to `target`
    async fn capture(&self, target: ScreenSize) -> Result<Vec<u8>>;
}

/// Capture backend that shells out to a screenshot tool
pub struct CommandScreen {
    capture: CommandTemplate,
    resize: Option<CommandTemplate>,
    size_command: Option<CommandTemplate>,
    size_override: Option<ScreenSize>,
}

impl CommandScreen {
    pub fn new(capture: CommandTemplate, resize: Option<CommandTemplate>) -> Self {
        Self {
            capture,
            resize,
            size_command: None,
            size_override: None,
        }
    }

    pub fn from_config(config: &ScreenConfig) -> Result<Self> {
        let capture = CommandTemplate::parse(&config.capture_command)
            .context("Invalid screen.capture_command")?;
        let resize = optional_template(config.resize_command.as_deref())
            .context("Invalid screen.resize_command")?;
        let size_command = optional_template(config.size_command.as_deref())
            .context("Invalid screen.size_command")?;

        let mut screen = Self::new(capture, resize);
        screen.size_command = size_command;
        if let Some((w, h)) = config.size_override() {
            screen = screen.with_size_override(ScreenSize::new(w, h));
        }
        Ok(screen)
    }

    /// Ask a command for the logical screen size instead of trusting capture pixels
    pub fn with_size_command(mut self, command: CommandTemplate) -> Self {
        self.size_command = Some(command);
        self
    }

    pub fn with_size_override(mut self, size: ScreenSize) -> Self {
        self.size_override = Some(size);
        self
    }

    /// Program names this backend needs on PATH
    pub fn required_programs(&self) -> Vec<&str> {
        let mut programs = vec![self.capture.program()];
        if let Some(ref resize) = self.resize {
            programs.push(resize.program());
        }
        programs
    }

    async fn grab(&self, path: &std::path::Path) -> Result<Vec<u8>> {
        let vars = [("path", path.display().to_string())];
        process::run_template(&self.capture, &vars, CAPTURE_TIMEOUT)
            .await
            .context("Screen capture command failed")?;

        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read screenshot {}", path.display()))
    }
}

#[async_trait]
impl ScreenCapture for CommandScreen {
    async fn size(&self) -> Result<ScreenSize> {
        if let Some(size) = self.size_override {
            return Ok(size);
        }

        if let Some(ref command) = self.size_command {
            match process::run_template(command, &[], CAPTURE_TIMEOUT).await {
                Ok(output) => match parse_size_output(&output) {
                    Ok(size) => return Ok(size),
                    Err(e) => warn!(error = %e, "Unusable size command output, using capture size"),
                },
                Err(e) => warn!(error = %e, "Size command failed, using capture size"),
            }
        }

        let dir = tempfile::tempdir().context("Failed to create temp dir")?;
        let path = dir.path().join("size.png");
        let bytes = self.grab(&path).await?;
        png_dimensions(&bytes)
    }

    async fn capture(&self, target: ScreenSize) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir().context("Failed to create temp dir")?;
        let path = dir.path().join("screen.png");
        let bytes = self.grab(&path).await?;

        let native = png_dimensions(&bytes)?;
        if native == target {
            return Ok(bytes);
        }

        let Some(ref resize) = self.resize else {
            debug!(%native, %target, "No resize command configured, sending native capture");
            return Ok(bytes);
        };

        let vars = [
            ("path", path.display().to_string()),
            ("width", target.width.to_string()),
            ("height", target.height.to_string()),
        ];
        process::run_template(resize, &vars, CAPTURE_TIMEOUT)
            .await
            .context("Screenshot resize command failed")?;

        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read resized screenshot {}", path.display()))
    }
}
