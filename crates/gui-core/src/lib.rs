//! gui-core: Shared library for the GUI agent stdio bridge
//!
//! Provides:
//! - Configuration loading (config.toml)
//! - The line-JSON protocol and its event writer
//! - Screen capture and scaling
//! - Action code parsing and input drivers
//! - The agent abstraction with a hosted chat-model implementation
//! - The dispatcher and the bounded run loop

pub mod agent;
pub mod bridge;
pub mod code;
pub mod config;
pub mod input;
pub mod process;
pub mod protocol;
pub mod screen;
pub mod session;

pub use agent::{
    Agent, AgentFactory, AgentSpec, ChatAgentFactory, EngineParams, GroundingParams, Observation,
    Prediction,
};
pub use bridge::Bridge;
pub use config::Config;
pub use input::{Action, InputDriver, MouseButton};
pub use protocol::{Event, EventWriter, InitParams};
pub use screen::{scale_screen_dimensions, CommandScreen, ScreenCapture, ScreenSize};
pub use session::{classify, Classification, RunOutcome, Session};
