//! Grounding: element description to screen coordinates

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

use super::engine::{ChatEngine, ChatMessage};
use crate::screen::ScreenSize;

const GROUNDING_SYSTEM: &str = "You locate user interface elements in screenshots. \
Answer with the coordinate of one point inside the requested element, as `(x, y)`, and nothing else.";

fn number_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?"))
        .as_ref()
        .map_err(|e| anyhow!("Invalid coordinate pattern: {}", e))
}

/// Map the first two numbers in `reply` from grounding space to screen space
pub fn resolve_coordinates(
    reply: &str,
    grounding: ScreenSize,
    screen: ScreenSize,
) -> Result<(i32, i32)> {
    let numbers: Vec<f64> = number_pattern()?
        .find_iter(reply)
        .filter_map(|m| m.as_str().parse().ok())
        .take(2)
        .collect();

    let [x, y] = numbers[..] else {
        bail!("Grounding reply has no coordinates: {:?}", reply);
    };

    let x = x * f64::from(screen.width) / f64::from(grounding.width);
    let y = y * f64::from(screen.height) / f64::from(grounding.height);

    Ok((x.round() as i32, y.round() as i32))
}

pub struct GroundingModel {
    engine: ChatEngine,
    grounding: ScreenSize,
    screen: ScreenSize,
}

impl GroundingModel {
    pub fn new(engine: ChatEngine, grounding: ScreenSize, screen: ScreenSize) -> Result<Self> {
        if grounding.width == 0 || grounding.height == 0 {
            bail!("Grounding dimensions must be positive, got {}", grounding);
        }
        Ok(Self {
            engine,
            grounding,
            screen,
        })
    }

    /// Screen coordinates of the element matching `description`
    pub async fn locate(&self, description: &str, screenshot: &[u8]) -> Result<(i32, i32)> {
        let query = ChatMessage::user(format!(
            "Query: {}\nOutput only the coordinate of one point in your response.",
            description
        ))
        .with_image(screenshot.to_vec());

        let reply = self
            .engine
            .complete(GROUNDING_SYSTEM, &[query])
            .await
            .with_context(|| format!("Grounding failed for {:?}", description))?;

        let point = resolve_coordinates(&reply, self.grounding, self.screen)?;
        debug!(description, reply = %reply.trim(), x = point.0, y = point.1, "Grounded element");
        Ok(point)
    }
}
