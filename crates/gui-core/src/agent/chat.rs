//! Planner agent backed by a hosted chat model
//!
//! Each step the planner sees the instruction, the recent trajectory and the
//! current screenshot, and answers with exactly one `agent.*` call in a code
//! block. That call is grounded into `pyautogui` code, or into a sentinel the
//! run loop understands.

use std::collections::VecDeque;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::engine::{ChatEngine, ChatMessage};
use super::grounding::GroundingModel;
use super::{Agent, Observation, Prediction};
use crate::code::{self, Call, Literal};

/// Action text the run loop classifies instead of executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Done,
    Fail,
    Wait,
    Next,
}

impl Sentinel {
    pub fn as_str(self) -> &'static str {
        match self {
            Sentinel::Done => "DONE",
            Sentinel::Fail => "FAIL",
            Sentinel::Wait => "WAIT",
            Sentinel::Next => "NEXT",
        }
    }
}

const PLANNER_SYSTEM: &str = r#"You are operating a {platform} computer to complete the user's task.
Each turn you receive a screenshot of the screen. Decide on the single next action.

First explain briefly what you see and what you will do. Then output exactly one
action inside a ```python code block, using one of:

agent.click(element_description, num_clicks=1, button_type="left", hold_keys=[])
agent.type(text, element_description=None, overwrite=False, enter=False)
agent.scroll(element_description, clicks, shift=False)
agent.drag_and_drop(starting_description, ending_description)
agent.hotkey(keys)
agent.hold_and_press(hold_keys, press_keys)
agent.open(app_or_filename)
agent.wait()
agent.done()
agent.fail()

Element descriptions must be specific enough to find the element on screen.
Call agent.done() once the task is complete and agent.fail() if it cannot be completed."#;

const REFLECTION_SYSTEM: &str = "You review the progress of a computer-use agent. \
Given the task, the actions taken so far and the current screenshot, say in two or three \
sentences whether the last action worked and what should change. Do not propose code.";

#[derive(Debug, Clone)]
struct Turn {
    plan: String,
    code: String,
}

pub struct ChatAgent {
    planner: ChatEngine,
    grounding: GroundingModel,
    platform: String,
    max_trajectory_length: usize,
    enable_reflection: bool,
    trajectory: VecDeque<Turn>,
}

impl ChatAgent {
    pub fn new(
        planner: ChatEngine,
        grounding: GroundingModel,
        platform: impl Into<String>,
        max_trajectory_length: usize,
        enable_reflection: bool,
    ) -> Self {
        Self {
            planner,
            grounding,
            platform: platform.into(),
            max_trajectory_length,
            enable_reflection,
            trajectory: VecDeque::new(),
        }
    }

    fn history(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        for turn in &self.trajectory {
            messages.push(ChatMessage::user("(earlier screenshot omitted)"));
            messages.push(ChatMessage::assistant(turn.plan.clone()));
        }
        messages
    }

    async fn reflect(&self, instruction: &str, screenshot: &[u8]) -> Result<String> {
        let actions: Vec<String> = self
            .trajectory
            .iter()
            .enumerate()
            .map(|(i, turn)| format!("{}. {}", i + 1, turn.code))
            .collect();

        let prompt = format!(
            "Task: {}\n\nActions so far:\n{}\n\nThe screenshot shows the screen now.",
            instruction,
            actions.join("\n")
        );

        self.planner
            .complete(
                REFLECTION_SYSTEM,
                &[ChatMessage::user(prompt).with_image(screenshot.to_vec())],
            )
            .await
            .context("Reflection request failed")
    }

    async fn plan(
        &self,
        instruction: &str,
        reflection: Option<&str>,
        screenshot: &[u8],
    ) -> Result<String> {
        let system = PLANNER_SYSTEM.replace("{platform}", &self.platform);

        let mut prompt = format!("Task: {}", instruction);
        if let Some(reflection) = reflection {
            prompt.push_str("\n\nReflection on the previous step: ");
            prompt.push_str(reflection);
        }

        let mut messages = self.history();
        messages.push(ChatMessage::user(prompt).with_image(screenshot.to_vec()));

        self.planner
            .complete(&system, &messages)
            .await
            .context("Planner request failed")
    }

    /// Turn one `agent.*` call into executable code or a sentinel
    async fn ground(&self, call: &Call, screenshot: &[u8]) -> Result<String> {
        let method = call
            .target
            .strip_prefix("agent.")
            .ok_or_else(|| anyhow!("Expected an agent.* call, got {}", call.target))?;

        let code = match method {
            "done" => Sentinel::Done.as_str().to_string(),
            "fail" => Sentinel::Fail.as_str().to_string(),
            "wait" => Sentinel::Wait.as_str().to_string(),
            "next" => Sentinel::Next.as_str().to_string(),
            "click" => {
                let description = required_str(call, 0, "element_description")?;
                let (x, y) = self.grounding.locate(description, screenshot).await?;
                let clicks = call
                    .value(1, "num_clicks")
                    .and_then(Literal::as_i64)
                    .unwrap_or(1);
                let button = call
                    .value(2, "button_type")
                    .and_then(Literal::as_str)
                    .unwrap_or("left");
                let hold = string_list(call.value(3, "hold_keys"))?;

                let mut lines = Vec::new();
                lines.extend(hold.iter().map(|k| format!("pyautogui.keyDown({})", py_str(k))));
                lines.push(format!(
                    "pyautogui.click({}, {}, clicks={}, button={})",
                    x,
                    y,
                    clicks,
                    py_str(button)
                ));
                lines.extend(hold.iter().rev().map(|k| format!("pyautogui.keyUp({})", py_str(k))));
                lines.join("\n")
            }
            "type" => {
                let text = call.value(0, "text").and_then(Literal::as_str).unwrap_or("");
                let mut lines = Vec::new();

                let target = call
                    .value(1, "element_description")
                    .and_then(Literal::as_str);
                if let Some(description) = target {
                    let (x, y) = self.grounding.locate(description, screenshot).await?;
                    lines.push(format!("pyautogui.click({}, {})", x, y));
                }
                if flag(call, 2, "overwrite") {
                    let modifier = py_str(self.select_all_modifier());
                    lines.push(format!("pyautogui.hotkey({}, 'a')", modifier));
                    lines.push("pyautogui.press('backspace')".to_string());
                }
                if !text.is_empty() {
                    lines.push(format!("pyautogui.write({})", py_str(text)));
                }
                if flag(call, 3, "enter") {
                    lines.push("pyautogui.press('enter')".to_string());
                }
                lines.join("\n")
            }
            "scroll" => {
                let description = required_str(call, 0, "element_description")?;
                let clicks = call
                    .value(1, "clicks")
                    .and_then(Literal::as_i64)
                    .ok_or_else(|| anyhow!("agent.scroll needs clicks"))?;
                let (x, y) = self.grounding.locate(description, screenshot).await?;
                let function = if flag(call, 2, "shift") { "hscroll" } else { "scroll" };
                format!("pyautogui.moveTo({}, {})\npyautogui.{}({})", x, y, function, clicks)
            }
            "drag_and_drop" => {
                let start = required_str(call, 0, "starting_description")?;
                let end = required_str(call, 1, "ending_description")?;
                let (x1, y1) = self.grounding.locate(start, screenshot).await?;
                let (x2, y2) = self.grounding.locate(end, screenshot).await?;
                format!(
                    "pyautogui.moveTo({}, {})\npyautogui.dragTo({}, {}, duration=1.0, button='left')",
                    x1, y1, x2, y2
                )
            }
            "hotkey" => {
                let keys = string_list(call.value(0, "keys"))?;
                if keys.is_empty() {
                    bail!("agent.hotkey needs keys");
                }
                let keys: Vec<String> = keys.iter().map(|k| py_str(k)).collect();
                format!("pyautogui.hotkey({})", keys.join(", "))
            }
            "hold_and_press" => {
                let hold = string_list(call.value(0, "hold_keys"))?;
                let press = string_list(call.value(1, "press_keys"))?;
                let mut lines = Vec::new();
                lines.extend(hold.iter().map(|k| format!("pyautogui.keyDown({})", py_str(k))));
                lines.extend(press.iter().map(|k| format!("pyautogui.press({})", py_str(k))));
                lines.extend(hold.iter().rev().map(|k| format!("pyautogui.keyUp({})", py_str(k))));
                lines.join("\n")
            }
            "open" => {
                let target = required_str(call, 0, "app_or_filename")?;
                let launcher = if self.platform == "darwin" {
                    "pyautogui.hotkey('command', 'space')"
                } else {
                    "pyautogui.press('command')"
                };
                format!(
                    "{}\ntime.sleep(0.5)\npyautogui.write({})\npyautogui.press('enter')\ntime.sleep(1.0)",
                    launcher,
                    py_str(target)
                )
            }
            other => bail!("Unknown agent action: agent.{}", other),
        };

        Ok(code)
    }

    fn select_all_modifier(&self) -> &'static str {
        if self.platform == "darwin" {
            "command"
        } else {
            "ctrl"
        }
    }

    fn remember(&mut self, plan: String, code: String) {
        self.trajectory.push_back(Turn { plan, code });
        while self.trajectory.len() > self.max_trajectory_length {
            self.trajectory.pop_front();
        }
    }
}

#[async_trait]
impl Agent for ChatAgent {
    fn reset(&mut self) {
        self.trajectory.clear();
    }

    async fn predict(
        &mut self,
        instruction: &str,
        observation: &Observation,
    ) -> Result<Prediction> {
        let reflection = if self.enable_reflection && !self.trajectory.is_empty() {
            Some(self.reflect(instruction, &observation.screenshot).await?)
        } else {
            None
        };

        let plan = self
            .plan(instruction, reflection.as_deref(), &observation.screenshot)
            .await?;
        let plan_code = extract_code_block(&plan)
            .ok_or_else(|| anyhow!("Planner reply has no code block"))?;

        let calls = code::parse_program(&plan_code).context("Planner produced invalid code")?;
        let call = calls
            .first()
            .ok_or_else(|| anyhow!("Planner code block is empty"))?;
        if calls.len() > 1 {
            debug!(extra = calls.len() - 1, "Ignoring additional planner actions");
        }

        let exec_code = self.ground(call, &observation.screenshot).await?;
        info!(action = %call.target, model = %self.planner.model(), "Planned next action");

        let info = json!({
            "plan": plan,
            "plan_code": plan_code,
            "reflection": reflection,
            "exec_code": exec_code,
        });

        self.remember(plan, exec_code.clone());

        Ok(Prediction {
            info,
            actions: vec![exec_code],
        })
    }
}

/// Body of the last fenced code block
pub fn extract_code_block(text: &str) -> Option<String> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        // Skip the language tag line
        let body_start = after.find('\n').map(|i| i + 1)?;
        let body = &after[body_start..];
        let end = body.find("```")?;
        blocks.push(body[..end].trim().to_string());
        rest = &body[end + 3..];
    }

    blocks.pop()
}

/// Render a Python string literal
fn py_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn required_str<'a>(call: &'a Call, position: usize, name: &str) -> Result<&'a str> {
    call.value(position, name)
        .and_then(Literal::as_str)
        .ok_or_else(|| anyhow!("{} needs {}", call.target, name))
}

fn flag(call: &Call, position: usize, name: &str) -> bool {
    call.value(position, name)
        .and_then(Literal::as_bool)
        .unwrap_or(false)
}

/// A key list given as a list of strings or a single string
fn string_list(value: Option<&Literal>) -> Result<Vec<String>> {
    match value {
        None => Ok(Vec::new()),
        Some(Literal::Str(s)) => Ok(vec![s.clone()]),
        Some(Literal::List(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("Key names must be strings"))
            })
            .collect(),
        Some(_) => bail!("Expected a list of keys"),
    }
}
