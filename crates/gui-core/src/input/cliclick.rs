//! macOS input via cliclick
//!
//! cliclick has no scroll wheel or middle button, so those are posted as
//! Quartz events from a JavaScript for Automation snippet run by `osascript`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::time::Duration;

use super::{InputDriver, MouseButton};
use crate::process;

pub struct CliclickDriver {
    timeout: Duration,
}

impl CliclickDriver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn cliclick(&self, commands: Vec<String>) -> Result<()> {
        process::run("cliclick", &commands, self.timeout).await?;
        Ok(())
    }

    async fn quartz(&self, script: String) -> Result<()> {
        let args = ["-l".to_string(), "JavaScript".to_string(), "-e".to_string(), script];
        process::run("osascript", &args, self.timeout).await?;
        Ok(())
    }
}

// CGEventTapLocation, CGScrollEventUnit, CGEventType and CGMouseButton values
const HID_EVENT_TAP: u32 = 0;
const SCROLL_UNIT_LINE: u32 = 1;
const OTHER_MOUSE_DOWN: u32 = 25;
const OTHER_MOUSE_UP: u32 = 26;
const MOUSE_BUTTON_CENTER: u32 = 2;

/// Post one scroll wheel event at the pointer; positive scrolls up / right
fn scroll_script(vertical: i32, horizontal: i32) -> String {
    format!(
        "ObjC.import(\"CoreGraphics\"); \
         $.CGEventPost({tap}, $.CGEventCreateScrollWheelEvent2(null, {unit}, 2, {vertical}, {horizontal}, 0));",
        tap = HID_EVENT_TAP,
        unit = SCROLL_UNIT_LINE,
    )
}

/// Press and release the middle button `count` times at the pointer
fn middle_click_script(count: u32) -> String {
    format!(
        "ObjC.import(\"CoreGraphics\"); \
         var p = $.CGEventGetLocation($.CGEventCreate(null)); \
         for (var i = 0; i < {count}; i++) {{ \
         $.CGEventPost({tap}, $.CGEventCreateMouseEvent(null, {down}, p, {button})); \
         $.CGEventPost({tap}, $.CGEventCreateMouseEvent(null, {up}, p, {button})); }}",
        tap = HID_EVENT_TAP,
        down = OTHER_MOUSE_DOWN,
        up = OTHER_MOUSE_UP,
        button = MOUSE_BUTTON_CENTER,
    )
}

/// Coordinate argument; negative absolute values need a `=` prefix
fn coord(value: i32) -> String {
    if value < 0 {
        format!("={}", value)
    } else {
        value.to_string()
    }
}

fn relative(value: i32) -> String {
    if value < 0 {
        value.to_string()
    } else {
        format!("+{}", value)
    }
}

fn is_modifier(key: &str) -> bool {
    matches!(key, "ctrl" | "shift" | "alt" | "command" | "fn")
}

fn modifier_name(key: &str) -> &str {
    match key {
        "command" => "cmd",
        other => other,
    }
}

/// Name for the `kp:` command, if cliclick knows the key
fn special_key(key: &str) -> Option<String> {
    let name = match key {
        "enter" => "return",
        "esc" => "esc",
        "tab" => "tab",
        "space" => "space",
        "backspace" => "delete",
        "delete" => "fwd-delete",
        "home" => "home",
        "end" => "end",
        "pageup" => "page-up",
        "pagedown" => "page-down",
        "up" => "arrow-up",
        "down" => "arrow-down",
        "left" => "arrow-left",
        "right" => "arrow-right",
        "volumeup" => "volume-up",
        "volumedown" => "volume-down",
        "volumemute" => "mute",
        other => {
            let n = other.strip_prefix('f')?.parse::<u8>().ok()?;
            if (1..=16).contains(&n) {
                return Some(format!("f{}", n));
            }
            return None;
        }
    };
    Some(name.to_string())
}

/// cliclick command for a single non-modifier key
fn key_command(key: &str) -> Result<String> {
    if let Some(name) = special_key(key) {
        return Ok(format!("kp:{}", name));
    }
    if key.chars().count() == 1 {
        return Ok(format!("t:{}", key));
    }
    bail!("cliclick cannot press key {:?}", key)
}

fn click_command(button: MouseButton, count: u32) -> Result<Vec<String>> {
    let command = match (button, count) {
        (_, 0) => return Ok(Vec::new()),
        (MouseButton::Left, 1) => "c:.",
        (MouseButton::Left, 2) => "dc:.",
        (MouseButton::Left, 3) => "tc:.",
        (MouseButton::Left, n) => {
            return Ok((0..n).map(|_| "c:.".to_string()).collect());
        }
        (MouseButton::Right, 1) => "rc:.",
        (MouseButton::Right, n) => {
            return Ok((0..n).map(|_| "rc:.".to_string()).collect());
        }
        (MouseButton::Middle, _) => bail!("cliclick does not support middle clicks"),
    };
    Ok(vec![command.to_string()])
}

fn hotkey_commands(keys: &[String]) -> Result<Vec<String>> {
    let (modifiers, others): (Vec<&String>, Vec<&String>) =
        keys.iter().partition(|k| is_modifier(k));

    let mut commands = Vec::new();
    let held: Vec<&str> = modifiers.iter().map(|k| modifier_name(k)).collect();
    if !held.is_empty() {
        commands.push(format!("kd:{}", held.join(",")));
    }
    for key in others {
        commands.push(key_command(key)?);
    }
    if !held.is_empty() {
        commands.push(format!("ku:{}", held.join(",")));
    }
    Ok(commands)
}

#[async_trait]
impl InputDriver for CliclickDriver {
    fn name(&self) -> &str {
        "cliclick"
    }

    async fn move_to(&self, x: i32, y: i32) -> Result<()> {
        self.cliclick(vec![format!("m:{},{}", coord(x), coord(y))]).await
    }

    async fn move_by(&self, dx: i32, dy: i32) -> Result<()> {
        self.cliclick(vec![format!("m:{},{}", relative(dx), relative(dy))])
            .await
    }

    async fn click(&self, button: MouseButton, count: u32) -> Result<()> {
        if button == MouseButton::Middle {
            if count == 0 {
                return Ok(());
            }
            return self.quartz(middle_click_script(count)).await;
        }

        let commands = click_command(button, count)?;
        if commands.is_empty() {
            return Ok(());
        }
        self.cliclick(commands).await
    }

    async fn button_down(&self, button: MouseButton) -> Result<()> {
        if button != MouseButton::Left {
            bail!("cliclick can only hold the left button");
        }
        self.cliclick(vec!["dd:.".to_string()]).await
    }

    async fn button_up(&self, button: MouseButton) -> Result<()> {
        if button != MouseButton::Left {
            bail!("cliclick can only hold the left button");
        }
        self.cliclick(vec!["du:.".to_string()]).await
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        // Newlines are not typeable; send them as return presses
        let mut commands = Vec::new();
        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                commands.push("kp:return".to_string());
            }
            if !line.is_empty() {
                commands.push(format!("t:{}", line));
            }
        }
        self.cliclick(commands).await
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        if is_modifier(key) {
            let name = modifier_name(key);
            return self
                .cliclick(vec![format!("kd:{}", name), format!("ku:{}", name)])
                .await;
        }
        self.cliclick(vec![key_command(key)?]).await
    }

    async fn key_down(&self, key: &str) -> Result<()> {
        if !is_modifier(key) {
            bail!("cliclick can only hold modifier keys, not {:?}", key);
        }
        self.cliclick(vec![format!("kd:{}", modifier_name(key))]).await
    }

    async fn key_up(&self, key: &str) -> Result<()> {
        if !is_modifier(key) {
            bail!("cliclick can only hold modifier keys, not {:?}", key);
        }
        self.cliclick(vec![format!("ku:{}", modifier_name(key))]).await
    }

    async fn scroll(&self, vertical: i32, horizontal: i32) -> Result<()> {
        if vertical == 0 && horizontal == 0 {
            return Ok(());
        }
        self.quartz(scroll_script(vertical, horizontal)).await
    }

    async fn hotkey(&self, keys: &[String]) -> Result<()> {
        self.cliclick(hotkey_commands(keys)?).await
    }
}
