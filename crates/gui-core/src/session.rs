//! Bounded capture / predict / execute loop

use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncWrite;
use tracing::{debug, info, instrument, warn};

use crate::agent::{Agent, Observation};
use crate::config::PacingConfig;
use crate::input::{self, InputDriver};
use crate::protocol::{Event, EventWriter};
use crate::screen::{ScreenCapture, ScreenSize};

/// How the run loop treats the agent's action text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Done,
    Fail,
    Wait,
    Next,
    Execute,
}

/// Classify action text by keyword, case-insensitively
///
/// Keywords are matched as substrings anywhere in the text, checked in the
/// order done, fail, wait, next.
pub fn classify(code: &str) -> Classification {
    let low = code.to_lowercase();
    if low.contains("done") {
        Classification::Done
    } else if low.contains("fail") {
        Classification::Fail
    } else if low.contains("wait") {
        Classification::Wait
    } else if low.contains("next") {
        Classification::Next
    } else {
        Classification::Execute
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No query was given
    Rejected,
    Done { steps: usize },
    Failed { steps: usize },
    TimedOut,
}

/// An initialized agent bound to one screen
pub struct Session {
    agent: Box<dyn Agent>,
    /// Size screenshots are captured at for the agent
    scaled: ScreenSize,
    capture: Arc<dyn ScreenCapture>,
    input: Arc<dyn InputDriver>,
    max_steps: usize,
    pacing: PacingConfig,
}

impl Session {
    pub fn new(
        agent: Box<dyn Agent>,
        scaled: ScreenSize,
        capture: Arc<dyn ScreenCapture>,
        input: Arc<dyn InputDriver>,
    ) -> Self {
        Self {
            agent,
            scaled,
            capture,
            input,
            max_steps: 30,
            pacing: PacingConfig::default(),
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self
    }

    /// Drive the agent until it finishes, gives up, or the step budget runs out
    ///
    /// Capture, prediction and execution failures are reported as events and
    /// the loop moves on to the next step. Only failures to write events are
    /// returned as errors.
    #[instrument(skip(self, out), fields(max_steps = self.max_steps))]
    pub async fn run<W>(
        &mut self,
        query: Option<&str>,
        out: &mut EventWriter<W>,
    ) -> Result<RunOutcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let instruction = match query {
            Some(q) if !q.is_empty() => q,
            _ => {
                out.send(&Event::error("Missing query")).await?;
                return Ok(RunOutcome::Rejected);
            }
        };

        info!(query_len = instruction.len(), "Starting run");
        self.agent.reset();
        let mut observation = Observation::default();

        for step in 0..self.max_steps {
            debug!(step, "Capturing screen");
            match self.capture.capture(self.scaled).await {
                Ok(png) => {
                    observation.screenshot = png;
                    out.send(&Event::Screenshot {
                        step,
                        scaled: self.scaled,
                    })
                    .await?;
                }
                Err(e) => {
                    warn!(step, error = %e, "Screenshot failed");
                    out.send(&Event::Error {
                        message: format!("screenshot_failed: {:#}", e),
                        step: Some(step),
                    })
                    .await?;
                    tokio::time::sleep(self.pacing.retry()).await;
                    continue;
                }
            }

            out.send(&Event::Predicting { step }).await?;
            let (info, code) = match self.agent.predict(instruction, &observation).await {
                Ok(prediction) => {
                    let code = prediction.actions.into_iter().next().unwrap_or_default();
                    (prediction.info, code)
                }
                Err(e) => {
                    warn!(step, error = %e, "Prediction failed");
                    out.send(&Event::PredictError {
                        error: format!("{:#}", e),
                        step,
                    })
                    .await?;
                    tokio::time::sleep(self.pacing.retry()).await;
                    continue;
                }
            };

            match classify(&code) {
                Classification::Done => {
                    info!(step, "Agent reported done");
                    out.send(&Event::Done { info }).await?;
                    return Ok(RunOutcome::Done { steps: step + 1 });
                }
                Classification::Fail => {
                    info!(step, "Agent reported failure");
                    out.send(&Event::Fail { info }).await?;
                    return Ok(RunOutcome::Failed { steps: step + 1 });
                }
                Classification::Wait => {
                    out.send(&Event::Wait {
                        seconds: self.pacing.wait().as_secs_f64(),
                    })
                    .await?;
                    tokio::time::sleep(self.pacing.wait()).await;
                    continue;
                }
                Classification::Next => {
                    out.send(&Event::Next).await?;
                    continue;
                }
                Classification::Execute => {}
            }

            out.send(&Event::Action {
                code: code.clone(),
                info,
                step,
            })
            .await?;
            tokio::time::sleep(self.pacing.pre_action()).await;

            match input::execute(self.input.as_ref(), &code).await {
                Ok(()) => {
                    debug!(step, "Action executed");
                    tokio::time::sleep(self.pacing.post_action()).await;
                }
                Err(e) => {
                    warn!(step, error = %e, "Action failed");
                    out.send(&Event::ExecError {
                        error: format!("{:#}", e),
                        code,
                        step,
                    })
                    .await?;
                    tokio::time::sleep(self.pacing.retry()).await;
                }
            }
        }

        info!(steps = self.max_steps, "Step budget exhausted");
        out.send(&Event::Timeout {
            steps: self.max_steps,
        })
        .await?;
        Ok(RunOutcome::TimedOut)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::Prediction;
    use crate::input::tests::RecordingDriver;
    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Agent replaying a fixed script of results
    pub struct ScriptedAgent {
        pub script: VecDeque<Result<Vec<String>, String>>,
        pub resets: Arc<AtomicUsize>,
        pub seen: Arc<Mutex<Vec<(String, usize)>>>,
    }

    impl ScriptedAgent {
        pub fn new(script: Vec<Result<Vec<String>, String>>) -> Self {
            Self {
                script: script.into(),
                resets: Arc::new(AtomicUsize::new(0)),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn actions(actions: &[&str]) -> Self {
            Self::new(actions.iter().map(|a| Ok(vec![a.to_string()])).collect())
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        async fn predict(
            &mut self,
            instruction: &str,
            observation: &Observation,
        ) -> Result<Prediction> {
            self.seen
                .lock()
                .unwrap()
                .push((instruction.to_string(), observation.screenshot.len()));
            match self.script.pop_front() {
                Some(Ok(actions)) => Ok(Prediction {
                    info: json!({"plan": "scripted"}),
                    actions,
                }),
                Some(Err(e)) => bail!("{}", e),
                None => Ok(Prediction {
                    info: Value::Null,
                    actions: vec!["pyautogui.moveTo(1, 1)".to_string()],
                }),
            }
        }
    }

    /// Capture source failing on the listed call indices
    pub struct FakeScreen {
        pub size: ScreenSize,
        pub fail_on: Vec<usize>,
        pub calls: AtomicUsize,
    }

    impl FakeScreen {
        pub fn new(size: ScreenSize) -> Self {
            Self {
                size,
                fail_on: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ScreenCapture for FakeScreen {
        async fn size(&self) -> Result<ScreenSize> {
            Ok(self.size)
        }

        async fn capture(&self, _target: ScreenSize) -> Result<Vec<u8>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&n) {
                bail!("display unavailable");
            }
            Ok(vec![0u8; 16])
        }
    }

    fn session(agent: ScriptedAgent, screen: FakeScreen, driver: Arc<RecordingDriver>) -> Session {
        let size = ScreenSize::new(1920, 1080);
        Session::new(Box::new(agent), size, Arc::new(screen), driver)
            .with_pacing(PacingConfig::immediate())
    }

    async fn run(session: &mut Session, query: Option<&str>) -> (RunOutcome, Vec<Value>) {
        let mut out = EventWriter::new(Vec::new());
        let outcome = session.run(query, &mut out).await.unwrap();
        let events = String::from_utf8(out.into_inner())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (outcome, events)
    }

    fn kinds(events: &[Value]) -> Vec<&str> {
        events.iter().map(|e| e["type"].as_str().unwrap()).collect()
    }

    #[test]
    fn test_classify_order_and_case() {
        assert_eq!(classify("DONE"), Classification::Done);
        assert_eq!(classify("Fail"), Classification::Fail);
        assert_eq!(classify("WAIT"), Classification::Wait);
        assert_eq!(classify("next"), Classification::Next);
        assert_eq!(classify("done or fail"), Classification::Done);
        assert_eq!(classify("pyautogui.click(1, 2)"), Classification::Execute);
        assert_eq!(classify(""), Classification::Execute);
    }

    #[tokio::test]
    async fn test_missing_query() {
        let agent = ScriptedAgent::actions(&[]);
        let resets = agent.resets.clone();
        let mut session = session(agent, FakeScreen::new(ScreenSize::new(1, 1)), Arc::default());

        let (outcome, events) = run(&mut session, Some("")).await;
        assert_eq!(outcome, RunOutcome::Rejected);
        assert_eq!(events, vec![json!({"type": "error", "message": "Missing query"})]);
        assert_eq!(resets.load(Ordering::SeqCst), 0);

        let (outcome, _) = run(&mut session, None).await;
        assert_eq!(outcome, RunOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_action_then_done() {
        let agent = ScriptedAgent::actions(&["pyautogui.click(10, 20)", "DONE"]);
        let resets = agent.resets.clone();
        let seen = agent.seen.clone();
        let driver = Arc::new(RecordingDriver::default());
        let mut session = session(agent, FakeScreen::new(ScreenSize::new(1, 1)), driver.clone());

        let (outcome, events) = run(&mut session, Some("open the menu")).await;
        assert_eq!(outcome, RunOutcome::Done { steps: 2 });
        assert_eq!(
            kinds(&events),
            vec!["screenshot", "predicting", "action", "screenshot", "predicting", "done"]
        );
        assert_eq!(events[0]["scaled"], json!({"width": 1920, "height": 1080}));
        assert_eq!(events[2]["code"], "pyautogui.click(10, 20)");
        assert_eq!(events[2]["step"], 0);
        assert_eq!(events[5]["info"], json!({"plan": "scripted"}));

        assert_eq!(driver.log(), vec!["move 10 20", "click Left 1"]);
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap()[0], ("open the menu".to_string(), 16));
    }

    #[tokio::test]
    async fn test_fail_ends_run() {
        let agent = ScriptedAgent::actions(&["FAIL"]);
        let mut session = session(agent, FakeScreen::new(ScreenSize::new(1, 1)), Arc::default());

        let (outcome, events) = run(&mut session, Some("x")).await;
        assert_eq!(outcome, RunOutcome::Failed { steps: 1 });
        assert_eq!(kinds(&events), vec!["screenshot", "predicting", "fail"]);
    }

    #[tokio::test]
    async fn test_recoverable_failures_continue() {
        let agent = ScriptedAgent::new(vec![
            Err("rate limited".to_string()),
            Ok(vec!["pyautogui.frobnicate()".to_string()]),
            Ok(vec!["WAIT".to_string()]),
            Ok(vec!["NEXT".to_string()]),
            Ok(vec!["done".to_string()]),
        ]);
        let mut screen = FakeScreen::new(ScreenSize::new(1, 1));
        screen.fail_on = vec![0];
        let mut session = session(agent, screen, Arc::default());

        let (outcome, events) = run(&mut session, Some("x")).await;
        assert_eq!(outcome, RunOutcome::Done { steps: 6 });
        assert_eq!(
            kinds(&events),
            vec![
                "error",
                "screenshot",
                "predicting",
                "predict_error",
                "screenshot",
                "predicting",
                "action",
                "exec_error",
                "screenshot",
                "predicting",
                "wait",
                "screenshot",
                "predicting",
                "next",
                "screenshot",
                "predicting",
                "done",
            ]
        );
        assert_eq!(events[0]["message"], "screenshot_failed: display unavailable");
        assert_eq!(events[0]["step"], 0);
        assert_eq!(events[3], json!({"type": "predict_error", "error": "rate limited", "step": 1}));
        assert_eq!(events[7]["code"], "pyautogui.frobnicate()");
        assert_eq!(events[7]["step"], 2);
        assert_eq!(events[10]["seconds"], 0.0);
    }

    #[tokio::test]
    async fn test_empty_prediction_is_noop_action() {
        let agent = ScriptedAgent::new(vec![Ok(vec![]), Ok(vec!["DONE".to_string()])]);
        let driver = Arc::new(RecordingDriver::default());
        let mut session = session(agent, FakeScreen::new(ScreenSize::new(1, 1)), driver.clone());

        let (_, events) = run(&mut session, Some("x")).await;
        assert_eq!(
            events[2],
            json!({"type": "action", "code": "", "info": {"plan": "scripted"}, "step": 0})
        );
        assert!(driver.log().is_empty());
    }

    #[tokio::test]
    async fn test_unrepresentable_sleep_is_exec_error() {
        let agent = ScriptedAgent::actions(&["time.sleep(1e20)", "DONE"]);
        let mut session = session(agent, FakeScreen::new(ScreenSize::new(1, 1)), Arc::default());

        let (outcome, events) = run(&mut session, Some("x")).await;
        assert_eq!(outcome, RunOutcome::Done { steps: 2 });
        assert_eq!(
            kinds(&events),
            vec![
                "screenshot",
                "predicting",
                "action",
                "exec_error",
                "screenshot",
                "predicting",
                "done",
            ]
        );
        assert_eq!(events[3]["code"], "time.sleep(1e20)");
        assert!(events[3]["error"].as_str().unwrap().contains("out of range"));
    }

    #[tokio::test]
    async fn test_default_wait_reports_one_second() {
        let agent = ScriptedAgent::actions(&["WAIT", "DONE"]);
        let pacing = PacingConfig {
            wait_ms: PacingConfig::default().wait_ms,
            ..PacingConfig::immediate()
        };
        let mut session = session(agent, FakeScreen::new(ScreenSize::new(1, 1)), Arc::default())
            .with_pacing(pacing);

        let (outcome, events) = run(&mut session, Some("x")).await;
        assert_eq!(outcome, RunOutcome::Done { steps: 2 });
        assert_eq!(events[2], json!({"type": "wait", "seconds": 1.0}));
    }

    #[tokio::test]
    async fn test_step_budget() {
        let agent = ScriptedAgent::actions(&[]);
        let mut session = session(agent, FakeScreen::new(ScreenSize::new(1, 1)), Arc::default())
            .with_max_steps(3);

        let (outcome, events) = run(&mut session, Some("loop forever")).await;
        assert_eq!(outcome, RunOutcome::TimedOut);
        assert_eq!(events.iter().filter(|e| e["type"] == "action").count(), 3);
        assert_eq!(events.last().unwrap(), &json!({"type": "timeout", "steps": 3}));
    }
}
