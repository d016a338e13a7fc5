//! Simulated input
//!
//! Action code from the agent is parsed into [`Action`]s and replayed through
//! an [`InputDriver`]. Drivers wrap a platform tool; the pyautogui argument
//! conventions are resolved here so drivers only see primitives.

mod cliclick;
mod xdotool;

pub use cliclick::CliclickDriver;
pub use xdotool::XdotoolDriver;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::code::{self, Call, Literal};
use crate::config::{InputBackend, InputConfig};
use crate::process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "left" | "primary" => Ok(MouseButton::Left),
            "middle" => Ok(MouseButton::Middle),
            "right" | "secondary" => Ok(MouseButton::Right),
            other => bail!("Unknown mouse button: {}", other),
        }
    }
}

/// One input primitive, in screen coordinates
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    MoveTo { x: i32, y: i32 },
    MoveBy { dx: i32, dy: i32 },
    /// Click at a point, or at the current position when absent
    Click {
        at: Option<(i32, i32)>,
        button: MouseButton,
        clicks: u32,
    },
    /// Press at the current position, release at the target
    DragTo { x: i32, y: i32, button: MouseButton },
    MouseDown { at: Option<(i32, i32)>, button: MouseButton },
    MouseUp { at: Option<(i32, i32)>, button: MouseButton },
    TypeText { text: String },
    /// Press each key in order, `presses` times over
    Press { keys: Vec<String>, presses: u32 },
    /// Chord: hold all keys, release in reverse
    Hotkey { keys: Vec<String> },
    KeyDown { key: String },
    KeyUp { key: String },
    /// Positive scrolls up / right
    Scroll {
        vertical: i32,
        horizontal: i32,
        at: Option<(i32, i32)>,
    },
    Sleep { duration: Duration },
}

impl Action {
    /// Convert a parsed `pyautogui.*` or `time.sleep` call
    pub fn from_call(call: &Call) -> Result<Self> {
        let function = match call.target.split_once('.') {
            Some(("pyautogui", function)) => function,
            Some(("time", "sleep")) => {
                let seconds = float_arg(call, 0, "secs")?.unwrap_or(0.0);
                let duration = Duration::try_from_secs_f64(seconds.max(0.0))
                    .map_err(|_| anyhow!("Sleep duration out of range: {}", seconds))?;
                return Ok(Action::Sleep { duration });
            }
            _ => bail!("Unsupported call: {}", call.target),
        };

        let action = match function {
            "click" => Action::Click {
                at: point(call)?,
                button: button_arg(call, 4, MouseButton::Left)?,
                clicks: count_arg(call, 2, "clicks")?.unwrap_or(1),
            },
            "doubleClick" => Action::Click {
                at: point(call)?,
                button: button_arg(call, 3, MouseButton::Left)?,
                clicks: 2,
            },
            "tripleClick" => Action::Click {
                at: point(call)?,
                button: button_arg(call, 3, MouseButton::Left)?,
                clicks: 3,
            },
            "rightClick" => Action::Click {
                at: point(call)?,
                button: MouseButton::Right,
                clicks: 1,
            },
            "middleClick" => Action::Click {
                at: point(call)?,
                button: MouseButton::Middle,
                clicks: 1,
            },
            "moveTo" => {
                let (x, y) = point(call)?.ok_or_else(|| anyhow!("moveTo needs coordinates"))?;
                Action::MoveTo { x, y }
            }
            "moveRel" | "move" => {
                let (dx, dy) = offset(call)?;
                Action::MoveBy { dx, dy }
            }
            "dragTo" => {
                let (x, y) = point(call)?.ok_or_else(|| anyhow!("dragTo needs coordinates"))?;
                Action::DragTo {
                    x,
                    y,
                    button: button_arg(call, 4, MouseButton::Left)?,
                }
            }
            "mouseDown" => Action::MouseDown {
                at: point(call)?,
                button: button_arg(call, 2, MouseButton::Left)?,
            },
            "mouseUp" => Action::MouseUp {
                at: point(call)?,
                button: button_arg(call, 2, MouseButton::Left)?,
            },
            "typewrite" | "write" => match call.arg(0, "message") {
                Some(Literal::Str(text)) => Action::TypeText { text: text.clone() },
                Some(Literal::List(items)) => Action::Press {
                    keys: key_list(items)?,
                    presses: 1,
                },
                _ => bail!("{} needs a message", call.target),
            },
            "press" => {
                let keys = match call.arg(0, "keys") {
                    Some(Literal::Str(key)) => vec![normalize_key(key)],
                    Some(Literal::List(items)) => key_list(items)?,
                    _ => bail!("press needs a key"),
                };
                Action::Press {
                    keys,
                    presses: count_arg(call, 1, "presses")?.unwrap_or(1),
                }
            }
            "hotkey" => {
                let keys = match call.args.first() {
                    Some(Literal::List(items)) => key_list(items)?,
                    _ => key_list(&call.args)?,
                };
                if keys.is_empty() {
                    bail!("hotkey needs at least one key");
                }
                Action::Hotkey { keys }
            }
            "keyDown" | "keyUp" => {
                let key = call
                    .value(0, "key")
                    .and_then(Literal::as_str)
                    .map(normalize_key)
                    .ok_or_else(|| anyhow!("{} needs a key", call.target))?;
                if function == "keyDown" {
                    Action::KeyDown { key }
                } else {
                    Action::KeyUp { key }
                }
            }
            "scroll" | "vscroll" | "hscroll" => {
                let clicks = int_arg(call, 0, "clicks")?
                    .ok_or_else(|| anyhow!("{} needs a click count", call.target))?;
                let at = match (int_arg(call, 1, "x")?, int_arg(call, 2, "y")?) {
                    (Some(x), Some(y)) => Some((x, y)),
                    _ => None,
                };
                let (vertical, horizontal) = if function == "hscroll" {
                    (0, clicks)
                } else {
                    (clicks, 0)
                };
                Action::Scroll {
                    vertical,
                    horizontal,
                    at,
                }
            }
            other => bail!("Unsupported pyautogui function: {}", other),
        };

        Ok(action)
    }
}

/// Parse action code into primitives without running anything
pub fn compile(source: &str) -> Result<Vec<Action>> {
    let calls = code::parse_program(source).context("Invalid action code")?;
    calls.iter().map(Action::from_call).collect()
}

/// Parse and run action code, stopping at the first failure
pub async fn execute(driver: &dyn InputDriver, source: &str) -> Result<()> {
    let actions = compile(source)?;
    debug!(driver = driver.name(), count = actions.len(), "Executing actions");

    for action in &actions {
        perform(driver, action).await?;
    }

    Ok(())
}

/// Run a single action
pub async fn perform(driver: &dyn InputDriver, action: &Action) -> Result<()> {
    match action {
        Action::MoveTo { x, y } => driver.move_to(*x, *y).await,
        Action::MoveBy { dx, dy } => driver.move_by(*dx, *dy).await,
        Action::Click { at, button, clicks } => {
            if let Some((x, y)) = at {
                driver.move_to(*x, *y).await?;
            }
            driver.click(*button, *clicks).await
        }
        Action::DragTo { x, y, button } => {
            driver.button_down(*button).await?;
            driver.move_to(*x, *y).await?;
            driver.button_up(*button).await
        }
        Action::MouseDown { at, button } => {
            if let Some((x, y)) = at {
                driver.move_to(*x, *y).await?;
            }
            driver.button_down(*button).await
        }
        Action::MouseUp { at, button } => {
            if let Some((x, y)) = at {
                driver.move_to(*x, *y).await?;
            }
            driver.button_up(*button).await
        }
        Action::TypeText { text } => {
            if text.is_empty() {
                return Ok(());
            }
            driver.type_text(text).await
        }
        Action::Press { keys, presses } => {
            for _ in 0..*presses {
                for key in keys {
                    driver.press_key(key).await?;
                }
            }
            Ok(())
        }
        Action::Hotkey { keys } => driver.hotkey(keys).await,
        Action::KeyDown { key } => driver.key_down(key).await,
        Action::KeyUp { key } => driver.key_up(key).await,
        Action::Scroll {
            vertical,
            horizontal,
            at,
        } => {
            if let Some((x, y)) = at {
                driver.move_to(*x, *y).await?;
            }
            driver.scroll(*vertical, *horizontal).await
        }
        Action::Sleep { duration } => {
            tokio::time::sleep(*duration).await;
            Ok(())
        }
    }
}

/// Mouse and keyboard primitives
///
/// Key names are pyautogui names, lower-cased (see [`normalize_key`]).
#[async_trait]
pub trait InputDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn move_to(&self, x: i32, y: i32) -> Result<()>;

    async fn move_by(&self, dx: i32, dy: i32) -> Result<()>;

    /// Click at the current pointer position
    async fn click(&self, button: MouseButton, count: u32) -> Result<()>;

    async fn button_down(&self, button: MouseButton) -> Result<()>;

    async fn button_up(&self, button: MouseButton) -> Result<()>;

    async fn type_text(&self, text: &str) -> Result<()>;

    async fn press_key(&self, key: &str) -> Result<()>;

    async fn key_down(&self, key: &str) -> Result<()>;

    async fn key_up(&self, key: &str) -> Result<()>;

    async fn scroll(&self, vertical: i32, horizontal: i32) -> Result<()>;

    async fn hotkey(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.key_down(key).await?;
        }
        for key in keys.iter().rev() {
            self.key_up(key).await?;
        }
        Ok(())
    }
}

/// Pick a driver for this machine
pub fn detect_driver(config: &InputConfig) -> Result<Arc<dyn InputDriver>> {
    let timeout = Duration::from_secs(config.command_timeout_secs);

    let backend = match config.backend {
        InputBackend::Auto => {
            if cfg!(target_os = "macos") && process::is_available("cliclick") {
                InputBackend::Cliclick
            } else if process::is_available("xdotool") {
                InputBackend::Xdotool
            } else if process::is_available("cliclick") {
                InputBackend::Cliclick
            } else {
                bail!("No input backend found: install xdotool (Linux) or cliclick (macOS)");
            }
        }
        explicit => explicit,
    };

    info!(?backend, "Selected input backend");

    Ok(match backend {
        InputBackend::Cliclick => Arc::new(CliclickDriver::new(timeout)),
        _ => Arc::new(XdotoolDriver::new(timeout)),
    })
}

/// Lower-case a key name and fold pyautogui aliases
pub fn normalize_key(key: &str) -> String {
    if key.chars().count() == 1 {
        return key.to_string();
    }

    let lower = key.to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "return" => "enter",
        "escape" => "esc",
        "del" => "delete",
        "control" | "ctrlleft" | "ctrlright" => "ctrl",
        "shiftleft" | "shiftright" => "shift",
        "altleft" | "altright" | "option" | "optionleft" | "optionright" => "alt",
        "command" | "cmd" | "win" | "winleft" | "winright" | "super" | "meta" => "command",
        "pgup" | "page_up" => "pageup",
        "pgdn" | "page_down" => "pagedown",
        "arrowup" => "up",
        "arrowdown" => "down",
        "arrowleft" => "left",
        "arrowright" => "right",
        other => other,
    };
    canonical.to_string()
}

fn key_list(items: &[Literal]) -> Result<Vec<String>> {
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(normalize_key)
                .ok_or_else(|| anyhow!("Key names must be strings"))
        })
        .collect()
}

fn int_arg(call: &Call, position: usize, name: &str) -> Result<Option<i32>> {
    match call.value(position, name) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(|f| Some(f.round() as i32))
            .ok_or_else(|| anyhow!("{} must be a number", name)),
    }
}

fn float_arg(call: &Call, position: usize, name: &str) -> Result<Option<f64>> {
    match call.value(position, name) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a number", name)),
    }
}

fn count_arg(call: &Call, position: usize, name: &str) -> Result<Option<u32>> {
    match call.value(position, name) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .filter(|n| *n >= 0)
            .map(|n| Some(n as u32))
            .ok_or_else(|| anyhow!("{} must be a non-negative integer", name)),
    }
}

fn button_arg(call: &Call, position: usize, default: MouseButton) -> Result<MouseButton> {
    match call.value(position, "button") {
        None => Ok(default),
        Some(Literal::Str(name)) => MouseButton::parse(name),
        Some(_) => bail!("button must be a string"),
    }
}

/// `(x, y)` given as two numbers or as one pair
fn point(call: &Call) -> Result<Option<(i32, i32)>> {
    if let Some(Literal::List(pair)) = call.value(0, "x") {
        return match pair.as_slice() {
            [x, y] => match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => Ok(Some((x.round() as i32, y.round() as i32))),
                _ => bail!("Coordinates must be numbers"),
            },
            _ => bail!("Coordinate pair must have two elements"),
        };
    }

    match (int_arg(call, 0, "x")?, int_arg(call, 1, "y")?) {
        (Some(x), Some(y)) => Ok(Some((x, y))),
        (None, None) => Ok(None),
        _ => bail!("{} needs both x and y", call.target),
    }
}

fn offset(call: &Call) -> Result<(i32, i32)> {
    let dx = int_arg(call, 0, "xOffset")?.unwrap_or(0);
    let dy = int_arg(call, 1, "yOffset")?.unwrap_or(0);
    Ok((dx, dy))
}
