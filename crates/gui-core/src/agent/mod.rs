//! Agent abstraction
//!
//! The bridge only needs two calls from an agent: `reset` before a run and
//! `predict` once per step. [`ChatAgent`] is the bundled implementation,
//! backed by a hosted planner model and a grounding model.

mod chat;
mod engine;
mod grounding;

pub use chat::{ChatAgent, Sentinel};
pub use engine::{ChatEngine, ChatMessage, Provider, Role};
pub use grounding::GroundingModel;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Duration;

use crate::screen::ScreenSize;

/// What the agent sees at one step
#[derive(Debug, Clone, Default)]
pub struct Observation {
    /// PNG bytes, already resized to the scaled screen size
    pub screenshot: Vec<u8>,
}

/// Agent output for one step
#[derive(Debug, Clone, Default)]
pub struct Prediction {
    /// Free-form details forwarded to the host untouched
    pub info: Value,
    /// Action code, first entry is executed
    pub actions: Vec<String>,
}

#[async_trait]
pub trait Agent: Send {
    /// Forget all history from a previous run
    fn reset(&mut self);

    async fn predict(&mut self, instruction: &str, observation: &Observation) -> Result<Prediction>;
}

/// Connection parameters for one hosted model
#[derive(Clone, PartialEq, Eq)]
pub struct EngineParams {
    pub engine_type: String,
    pub model: String,
    /// Empty selects the provider's public endpoint
    pub base_url: String,
    /// Empty falls back to the provider's environment variable
    pub api_key: String,
}

impl std::fmt::Debug for EngineParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineParams")
            .field("engine_type", &self.engine_type)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundingParams {
    pub engine: EngineParams,
    /// Coordinate space the grounding model answers in
    pub grounding_width: u32,
    pub grounding_height: u32,
}

/// Everything needed to build an agent for the current screen
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub engine: EngineParams,
    pub grounding: GroundingParams,
    /// Full screen size; executed coordinates are in this space
    pub screen: ScreenSize,
    pub platform: String,
    pub max_trajectory_length: usize,
    pub enable_reflection: bool,
}

pub trait AgentFactory: Send + Sync {
    fn build(&self, spec: AgentSpec) -> Result<Box<dyn Agent>>;
}

/// Builds [`ChatAgent`]s talking to hosted models
#[derive(Debug, Clone)]
pub struct ChatAgentFactory {
    request_timeout: Duration,
}

impl ChatAgentFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for ChatAgentFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl AgentFactory for ChatAgentFactory {
    fn build(&self, spec: AgentSpec) -> Result<Box<dyn Agent>> {
        let planner = ChatEngine::new(spec.engine, self.request_timeout)?;
        let grounding_size = ScreenSize::new(
            spec.grounding.grounding_width,
            spec.grounding.grounding_height,
        );
        let grounder = ChatEngine::new(spec.grounding.engine, self.request_timeout)?;
        let grounding = GroundingModel::new(grounder, grounding_size, spec.screen)?;

        Ok(Box::new(ChatAgent::new(
            planner,
            grounding,
            spec.platform,
            spec.max_trajectory_length,
            spec.enable_reflection,
        )))
    }
}

/// Platform name handed to agents
pub fn current_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}
