//! X11 input via xdotool

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Duration;

use super::{InputDriver, MouseButton};
use crate::process;

/// Delay between typed characters, in milliseconds
const TYPE_DELAY_MS: u32 = 12;

pub struct XdotoolDriver {
    timeout: Duration,
}

impl XdotoolDriver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn xdotool(&self, args: Vec<String>) -> Result<()> {
        process::run("xdotool", &args, self.timeout).await?;
        Ok(())
    }
}

fn button_number(button: MouseButton) -> &'static str {
    match button {
        MouseButton::Left => "1",
        MouseButton::Middle => "2",
        MouseButton::Right => "3",
    }
}

/// Map a normalized key name to an X keysym
fn keysym(key: &str) -> String {
    let mapped = match key {
        "enter" => "Return",
        "esc" => "Escape",
        "tab" => "Tab",
        "space" | " " => "space",
        "backspace" => "BackSpace",
        "delete" => "Delete",
        "insert" => "Insert",
        "home" => "Home",
        "end" => "End",
        "pageup" => "Prior",
        "pagedown" => "Next",
        "up" => "Up",
        "down" => "Down",
        "left" => "Left",
        "right" => "Right",
        "ctrl" => "ctrl",
        "shift" => "shift",
        "alt" => "alt",
        "command" => "super",
        "capslock" => "Caps_Lock",
        "printscreen" | "prtsc" => "Print",
        "," => "comma",
        "." => "period",
        "/" => "slash",
        "\\" => "backslash",
        "-" => "minus",
        "=" => "equal",
        ";" => "semicolon",
        "'" => "apostrophe",
        "`" => "grave",
        "[" => "bracketleft",
        "]" => "bracketright",
        "\n" => "Return",
        "\t" => "Tab",
        other => {
            if let Some(n) = other.strip_prefix('f').filter(|n| n.parse::<u8>().is_ok()) {
                return format!("F{}", n);
            }
            other
        }
    };
    mapped.to_string()
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Button clicks for a scroll amount: 4/5 vertical, 6/7 horizontal
fn scroll_args(vertical: i32, horizontal: i32) -> Vec<Vec<String>> {
    let mut commands = Vec::new();
    if vertical != 0 {
        let button = if vertical > 0 { "4" } else { "5" };
        let repeat = vertical.unsigned_abs().to_string();
        commands.push(args(&["click", "--repeat", &repeat, button]));
    }
    if horizontal != 0 {
        let button = if horizontal > 0 { "7" } else { "6" };
        let repeat = horizontal.unsigned_abs().to_string();
        commands.push(args(&["click", "--repeat", &repeat, button]));
    }
    commands
}

#[async_trait]
impl InputDriver for XdotoolDriver {
    fn name(&self) -> &str {
        "xdotool"
    }

    async fn move_to(&self, x: i32, y: i32) -> Result<()> {
        self.xdotool(args(&["mousemove", "--", &x.to_string(), &y.to_string()]))
            .await
    }

    async fn move_by(&self, dx: i32, dy: i32) -> Result<()> {
        self.xdotool(args(&["mousemove_relative", "--", &dx.to_string(), &dy.to_string()]))
            .await
    }

    async fn click(&self, button: MouseButton, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.xdotool(args(&["click", "--repeat", &count.to_string(), button_number(button)]))
            .await
    }

    async fn button_down(&self, button: MouseButton) -> Result<()> {
        self.xdotool(args(&["mousedown", button_number(button)])).await
    }

    async fn button_up(&self, button: MouseButton) -> Result<()> {
        self.xdotool(args(&["mouseup", button_number(button)])).await
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.xdotool(args(&["type", "--delay", &TYPE_DELAY_MS.to_string(), "--", text]))
            .await
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.xdotool(args(&["key", "--", &keysym(key)])).await
    }

    async fn key_down(&self, key: &str) -> Result<()> {
        self.xdotool(args(&["keydown", "--", &keysym(key)])).await
    }

    async fn key_up(&self, key: &str) -> Result<()> {
        self.xdotool(args(&["keyup", "--", &keysym(key)])).await
    }

    async fn scroll(&self, vertical: i32, horizontal: i32) -> Result<()> {
        for command in scroll_args(vertical, horizontal) {
            self.xdotool(command).await?;
        }
        Ok(())
    }

    async fn hotkey(&self, keys: &[String]) -> Result<()> {
        let chord = keys.iter().map(|k| keysym(k)).collect::<Vec<_>>().join("+");
        self.xdotool(args(&["key", "--", &chord])).await
    }
}
