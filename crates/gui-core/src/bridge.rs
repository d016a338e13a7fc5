//! Request dispatcher
//!
//! Reads one request per line and answers with events. Requests are handled
//! strictly in order: a `run` occupies the bridge until it finishes, so a
//! `stop` sent meanwhile is only seen afterwards.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tracing::{debug, info, warn};

use crate::agent::{current_platform, AgentFactory, AgentSpec, EngineParams, GroundingParams};
use crate::config::Config;
use crate::input::InputDriver;
use crate::protocol::{Event, EventWriter, InitParams, Request};
use crate::screen::{scale_screen_dimensions, ScreenCapture};
use crate::session::Session;

/// Environment variable overriding the default planner model
pub const MODEL_ENV: &str = "GUI_BRIDGE_MODEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct Bridge {
    factory: Arc<dyn AgentFactory>,
    capture: Arc<dyn ScreenCapture>,
    input: Arc<dyn InputDriver>,
    config: Config,
    session: Option<Session>,
}

impl Bridge {
    pub fn new(
        factory: Arc<dyn AgentFactory>,
        capture: Arc<dyn ScreenCapture>,
        input: Arc<dyn InputDriver>,
        config: Config,
    ) -> Self {
        Self {
            factory,
            capture,
            input,
            config,
            session: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    /// Serve requests until `stop` or end of input
    pub async fn serve<R, W>(&mut self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send,
    {
        let mut reader = reader;
        let mut out = EventWriter::new(writer);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .await
                .context("Failed to read request")?;
            if read == 0 {
                info!("Input closed");
                break;
            }

            let Ok(line) = std::str::from_utf8(&buf) else {
                debug!(len = buf.len(), "Rejected non-UTF-8 line");
                out.send(&Event::error("Invalid JSON")).await?;
                continue;
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if self.handle_line(trimmed, &mut out).await? == Flow::Stop {
                break;
            }
        }

        Ok(())
    }

    async fn handle_line<W>(&mut self, line: &str, out: &mut EventWriter<W>) -> Result<Flow>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(request) = Request::parse(line) else {
            debug!(len = line.len(), "Rejected non-JSON line");
            out.send(&Event::error("Invalid JSON")).await?;
            return Ok(Flow::Continue);
        };

        match request {
            Request::Init(value) => {
                let event = match self.handle_init(value).await {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Init failed");
                        Event::error(format!("{:#}", e))
                    }
                };
                out.send(&event).await?;
            }
            Request::Run(params) => match self.session.as_mut() {
                Some(session) => {
                    let outcome = session.run(params.query.as_deref(), out).await?;
                    info!(?outcome, "Run finished");
                }
                None => out.send(&Event::error("Not initialized")).await?,
            },
            Request::Stop => {
                out.send(&Event::Stopped).await?;
                return Ok(Flow::Stop);
            }
            Request::Unknown(kind) => {
                out.send(&Event::error(format!("Unknown type: {}", kind)))
                    .await?;
            }
        }

        Ok(Flow::Continue)
    }

    /// Build a new session, replacing any previous one
    async fn handle_init(&mut self, value: Value) -> Result<Event> {
        let params: InitParams = serde_json::from_value(value)?;

        let screen = self
            .capture
            .size()
            .await
            .context("Failed to read screen size")?;
        let scaled = scale_screen_dimensions(screen, self.config.run.max_dimension);

        let engine = EngineParams {
            engine_type: params
                .provider
                .unwrap_or_else(|| self.config.agent.default_provider.clone()),
            model: params
                .model
                .or_else(|| std::env::var(MODEL_ENV).ok().filter(|m| !m.is_empty()))
                .unwrap_or_else(|| self.config.agent.default_model.clone()),
            base_url: params.model_url,
            api_key: params.model_api_key,
        };

        let grounding = GroundingParams {
            engine: EngineParams {
                engine_type: params.ground_provider,
                model: params.ground_model,
                base_url: params.ground_url,
                api_key: params.ground_api_key,
            },
            grounding_width: params.grounding_width,
            grounding_height: params.grounding_height,
        };

        info!(
            provider = %engine.engine_type,
            model = %engine.model,
            ground_model = %grounding.engine.model,
            %screen,
            %scaled,
            "Initializing agent"
        );

        let agent = self.factory.build(AgentSpec {
            engine,
            grounding,
            screen,
            platform: current_platform().to_string(),
            max_trajectory_length: params.max_trajectory_length,
            enable_reflection: params.enable_reflection,
        })?;

        let session = Session::new(
            agent,
            scaled,
            Arc::clone(&self.capture),
            Arc::clone(&self.input),
        )
        .with_max_steps(self.config.run.max_steps)
        .with_pacing(self.config.pacing.clone());

        self.session = Some(session);

        Ok(Event::Inited { screen, scaled })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::config::PacingConfig;
    use crate::input::tests::RecordingDriver;
    use crate::screen::ScreenSize;
    use crate::session::tests::{FakeScreen, ScriptedAgent};
    use anyhow::bail;
    use serde_json::json;
    use std::sync::Mutex;

    /// Factory handing out scripted agents and remembering the specs it saw
    struct ScriptedFactory {
        scripts: Mutex<Vec<Vec<&'static str>>>,
        specs: Mutex<Vec<AgentSpec>>,
        fail: bool,
    }

    impl ScriptedFactory {
        fn new(scripts: Vec<Vec<&'static str>>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
                specs: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    impl AgentFactory for ScriptedFactory {
        fn build(&self, spec: AgentSpec) -> Result<Box<dyn Agent>> {
            if self.fail {
                bail!("engine unavailable");
            }
            self.specs.lock().unwrap().push(spec);
            let mut scripts = self.scripts.lock().unwrap();
            let script = if scripts.is_empty() { Vec::new() } else { scripts.remove(0) };
            Ok(Box::new(ScriptedAgent::actions(&script)))
        }
    }

    const INIT: &str = r#"{"type":"init","ground_provider":"huggingface","ground_url":"http://localhost:8080","ground_model":"ui-tars","grounding_width":1000,"grounding_height":1000}"#;

    fn config() -> Config {
        let mut config = Config::default();
        config.pacing = PacingConfig::immediate();
        config
    }

    fn bridge(factory: Arc<ScriptedFactory>, screen: ScreenSize) -> (Bridge, Arc<RecordingDriver>) {
        let driver = Arc::new(RecordingDriver::default());
        let bridge = Bridge::new(
            factory,
            Arc::new(FakeScreen::new(screen)),
            driver.clone(),
            config(),
        );
        (bridge, driver)
    }

    async fn serve(bridge: &mut Bridge, input: &str) -> Vec<Value> {
        let mut output = Vec::new();
        bridge.serve(input.as_bytes(), &mut output).await.unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_init_reports_dimensions() {
        let factory = Arc::new(ScriptedFactory::new(vec![]));
        let (mut bridge, _) = bridge(factory.clone(), ScreenSize::new(3840, 2160));

        let events = serve(&mut bridge, &format!("{}\n", INIT)).await;
        assert_eq!(
            events,
            vec![json!({
                "type": "inited",
                "screen": {"width": 3840, "height": 2160},
                "scaled": {"width": 2400, "height": 1350}
            })]
        );
        assert!(bridge.is_initialized());

        let specs = factory.specs.lock().unwrap();
        assert_eq!(specs[0].engine.engine_type, "openai");
        assert_eq!(specs[0].engine.base_url, "");
        assert_eq!(specs[0].grounding.engine.engine_type, "huggingface");
        assert_eq!(specs[0].grounding.grounding_width, 1000);
        assert_eq!(specs[0].screen, ScreenSize::new(3840, 2160));
        assert_eq!(specs[0].max_trajectory_length, 8);
        assert!(specs[0].enable_reflection);
    }

    #[tokio::test]
    async fn test_init_passes_overrides() {
        let factory = Arc::new(ScriptedFactory::new(vec![]));
        let (mut bridge, _) = bridge(factory.clone(), ScreenSize::new(1440, 900));

        let init = r#"{"type":"init","provider":"anthropic","model":"claude-sonnet","model_api_key":"k","ground_provider":"vllm","ground_url":"http://g","ground_model":"g","grounding_width":"1920","grounding_height":1080,"max_trajectory_length":3,"enable_reflection":false}"#;
        serve(&mut bridge, init).await;

        let specs = factory.specs.lock().unwrap();
        assert_eq!(specs[0].engine.engine_type, "anthropic");
        assert_eq!(specs[0].engine.model, "claude-sonnet");
        assert_eq!(specs[0].engine.api_key, "k");
        assert_eq!(specs[0].grounding.grounding_width, 1920);
        assert_eq!(specs[0].max_trajectory_length, 3);
        assert!(!specs[0].enable_reflection);
    }

    #[tokio::test]
    async fn test_init_errors_keep_serving() {
        let factory = Arc::new(ScriptedFactory::new(vec![]));
        let (mut bridge, _) = bridge(factory, ScreenSize::new(800, 600));

        let input = "{\"type\":\"init\",\"ground_provider\":\"x\"}\n{\"type\":\"stop\"}\n";
        let events = serve(&mut bridge, input).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "error");
        assert!(events[0]["message"].as_str().unwrap().contains("missing field"));
        assert_eq!(events[1], json!({"type": "stopped"}));
        assert!(!bridge.is_initialized());
    }

    #[tokio::test]
    async fn test_factory_failure_is_reported() {
        let mut factory = ScriptedFactory::new(vec![]);
        factory.fail = true;
        let (mut bridge, _) = bridge(Arc::new(factory), ScreenSize::new(800, 600));

        let events = serve(&mut bridge, INIT).await;
        assert_eq!(events, vec![json!({"type": "error", "message": "engine unavailable"})]);
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let factory = Arc::new(ScriptedFactory::new(vec![]));
        let (mut bridge, _) = bridge(factory, ScreenSize::new(800, 600));

        let input = "\n   \nnot json\n{\"type\":\"run\",\"query\":\"x\"}\n{\"type\":\"pause\"}\n{\"query\":1}\n";
        let events = serve(&mut bridge, input).await;
        assert_eq!(
            events,
            vec![
                json!({"type": "error", "message": "Invalid JSON"}),
                json!({"type": "error", "message": "Not initialized"}),
                json!({"type": "error", "message": "Unknown type: pause"}),
                json!({"type": "error", "message": "Unknown type: null"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_invalid_json() {
        let factory = Arc::new(ScriptedFactory::new(vec![]));
        let (mut bridge, _) = bridge(factory, ScreenSize::new(800, 600));

        let mut output = Vec::new();
        let input: &[u8] = b"\xff\xfe garbage\n{\"type\":\"stop\"}\n";
        bridge.serve(input, &mut output).await.unwrap();

        let events: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            events,
            vec![
                json!({"type": "error", "message": "Invalid JSON"}),
                json!({"type": "stopped"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_full_session() {
        let factory = Arc::new(ScriptedFactory::new(vec![
            vec!["pyautogui.hotkey('ctrl', 's')", "DONE"],
            vec!["FAIL"],
        ]));
        let (mut bridge, driver) = bridge(factory, ScreenSize::new(1920, 1080));

        let input = format!(
            "{}\n{}\n{}\n{}\n{}\n",
            INIT,
            r#"{"type":"run","query":"save the file"}"#,
            r#"{"type":"run"}"#,
            r#"{"type":"stop"}"#,
            r#"{"type":"run","query":"never read"}"#,
        );
        let events = serve(&mut bridge, &input).await;
        let kinds: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                "inited",
                "screenshot",
                "predicting",
                "action",
                "screenshot",
                "predicting",
                "done",
                "error",
                "stopped",
            ]
        );
        assert_eq!(events[7]["message"], "Missing query");
        assert_eq!(
            driver.log(),
            vec!["key_down ctrl", "key_down s", "key_up s", "key_up ctrl"]
        );
    }

    #[tokio::test]
    async fn test_reinit_replaces_session() {
        let factory = Arc::new(ScriptedFactory::new(vec![vec!["DONE"], vec!["FAIL"]]));
        let (mut bridge, _) = bridge(factory.clone(), ScreenSize::new(1920, 1080));

        let input = format!(
            "{}\n{}\n{}\n",
            INIT,
            INIT,
            r#"{"type":"run","query":"go"}"#
        );
        let events = serve(&mut bridge, &input).await;
        assert_eq!(events.last().unwrap()["type"], "fail");
        assert_eq!(factory.specs.lock().unwrap().len(), 2);
    }
}
