use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capabilities::{InputMonitor, ScreenCapture, ScreenClassifier};
use crate::config::AssistConfig;
use crate::error::AssistError;
use crate::retry::{bounded, with_backoff};
use crate::types::{
    ExecutionReceipt, GoalPredicate, InputEvent, PageStatus, ScreenClassification, Screenshot,
    Step, StepKind, StepOutcome, Task,
};

const BROWSER_WORDS: &[&str] = &["浏览器", "browser", "edge", "chrome", "chromium", "firefox", "safari", "360浏览器"];
const DESKTOP_WORDS: &[&str] = &["桌面", "desktop"];

/// Loose app-name match: either name contains the other, browsers match as a family.
pub fn app_matches(current: &str, target: &str) -> bool {
    let current = current.trim().to_lowercase();
    let target = target.trim().to_lowercase();
    if current.is_empty() || target.is_empty() {
        return false;
    }
    let is_browser = |s: &str| BROWSER_WORDS.iter().any(|w| s.contains(w));
    if is_browser(&target) {
        return is_browser(&current);
    }
    current.contains(&target) || target.contains(&current)
}

/// Evaluates the intent-derived goal predicate against one screen observation.
pub fn goal_satisfied(predicate: &GoalPredicate, goal_text: &str, screen: &ScreenClassification) -> bool {
    if predicate.is_empty() {
        return false;
    }
    let on_desktop = screen.is_desktop || DESKTOP_WORDS.iter().any(|w| screen.app.to_lowercase().contains(w));
    let goal_text = goal_text.to_lowercase();
    if on_desktop && !DESKTOP_WORDS.iter().any(|w| goal_text.contains(w)) {
        return false;
    }
    if let Some(app) = predicate.target_app.as_deref().filter(|a| !a.trim().is_empty()) {
        if !app_matches(&screen.app, app) {
            return false;
        }
    }
    let haystack = screen.haystack();
    if let Some(state) = predicate.target_state.as_deref().filter(|s| !s.trim().is_empty()) {
        let keywords: Vec<String> = state
            .to_lowercase()
            .split_whitespace()
            .filter(|k| k.chars().count() > 1)
            .map(str::to_string)
            .collect();
        if !keywords.is_empty() {
            let hits = keywords.iter().filter(|k| haystack.contains(k.as_str())).count();
            if (hits as f32 / keywords.len() as f32) < 0.3 {
                return false;
            }
        }
    }
    predicate
        .success_criteria
        .iter()
        .all(|c| haystack.contains(&c.trim().to_lowercase()))
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScreenDiff {
    pub app_changed: bool,
    pub page_changed: bool,
    pub elements_added: Vec<String>,
    pub elements_removed: Vec<String>,
}

impl ScreenDiff {
    pub fn between(before: &ScreenClassification, after: &ScreenClassification) -> Self {
        Self {
            app_changed: before.app.trim() != after.app.trim(),
            page_changed: before.page_state.trim() != after.page_state.trim()
                || before.page_status != after.page_status,
            elements_added: after.elements.iter().filter(|e| !before.elements.contains(e)).cloned().collect(),
            elements_removed: before.elements.iter().filter(|e| !after.elements.contains(e)).cloned().collect(),
        }
    }

    /// App or page transitions count; element churn alone (ads, animations) does not.
    pub fn is_meaningful(&self) -> bool {
        self.app_changed || self.page_changed
    }

    pub fn elements_changed(&self) -> bool {
        !self.elements_added.is_empty() || !self.elements_removed.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgePhase {
    Armed,
    Observing,
    Timeout,
    Resolved,
}

#[derive(Clone, Debug)]
enum Trigger<'a> {
    UserInput(&'a InputEvent),
    Settled,
    Timeout,
}

#[derive(Clone, Debug, PartialEq)]
enum Assessment {
    Resolved(StepOutcome),
    KeepWaiting,
}

fn assess(
    step: &Step,
    before: &ScreenClassification,
    after: &ScreenClassification,
    trigger: Trigger<'_>,
) -> Assessment {
    if after.page_status == PageStatus::Error {
        return Assessment::Resolved(StepOutcome::failed(0.7, "the screen shows an error"));
    }
    if let Some(expected) = step.expected.as_deref() {
        if after.mentions(expected) {
            return Assessment::Resolved(StepOutcome::success(0.9, format!("expected result visible: {}", expected)));
        }
    }
    match step.kind {
        StepKind::OpenApp if app_matches(&after.app, &step.target_description) => {
            return Assessment::Resolved(StepOutcome::success(0.9, format!("{} is in front", after.app)));
        }
        StepKind::Type => {
            if let Some(text) = step.input.as_deref() {
                if after.mentions(text) {
                    return Assessment::Resolved(StepOutcome::success(0.8, "typed text is visible"));
                }
            }
        }
        _ => {}
    }

    let diff = ScreenDiff::between(before, after);
    if diff.is_meaningful() {
        let confidence = if matches!(trigger, Trigger::Timeout) { 0.6 } else { 0.7 };
        return Assessment::Resolved(StepOutcome::success(confidence, "screen moved to a new state"));
    }

    match trigger {
        Trigger::UserInput(ev) => {
            debug!(event = ?ev.kind, incidental = diff.elements_changed(), "input without meaningful change");
            Assessment::KeepWaiting
        }
        Trigger::Settled => match step.kind {
            StepKind::Query if !after.mentions(&step.target_description) => {
                Assessment::Resolved(StepOutcome::failed(0.4, format!("{} is not on screen", step.target_description)))
            }
            StepKind::Query => Assessment::Resolved(StepOutcome::success(0.6, "found on screen")),
            _ => Assessment::Resolved(StepOutcome::success(0.8, "waited")),
        },
        Trigger::Timeout if diff.elements_changed() => {
            Assessment::Resolved(StepOutcome::failed(0.3, "only incidental screen changes"))
        }
        Trigger::Timeout => Assessment::Resolved(StepOutcome::failed(0.2, "no change on screen")),
    }
}

#[derive(Clone, Debug)]
pub struct Judgement {
    pub outcome: StepOutcome,
    pub screen: ScreenClassification,
    pub screenshot: Option<Screenshot>,
    pub phases: Vec<JudgePhase>,
}

pub struct CompletionJudge {
    screen: Arc<dyn ScreenCapture>,
    classifier: Arc<dyn ScreenClassifier>,
    input: Arc<dyn InputMonitor>,
    cfg: AssistConfig,
}

impl CompletionJudge {
    pub fn new(
        screen: Arc<dyn ScreenCapture>,
        classifier: Arc<dyn ScreenClassifier>,
        input: Arc<dyn InputMonitor>,
        cfg: AssistConfig,
    ) -> Self {
        Self { screen, classifier, input, cfg }
    }

    /// Verifies one executed step against `baseline`, the light-tier view from before it ran.
    ///
    /// Always resolves within `judge_timeout` plus one capture round trip unless cancelled.
    pub async fn judge(
        &self,
        step: &Step,
        receipt: &ExecutionReceipt,
        baseline: &ScreenClassification,
        cancel: &CancellationToken,
    ) -> Result<Judgement, AssistError> {
        let mut phases = vec![JudgePhase::Armed];
        if !receipt.raw_outcome.performed {
            phases.push(JudgePhase::Resolved);
            let why = receipt.raw_outcome.message.clone().unwrap_or_else(|| "input was not delivered".into());
            return Ok(Judgement {
                outcome: StepOutcome::failed(0.9, why),
                screen: baseline.clone(),
                screenshot: None,
                phases,
            });
        }

        if step.kind.is_passive() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AssistError::UserAbandoned("cancelled while judging".into())),
                _ = sleep(self.cfg.settle_delay) => {}
            }
            phases.push(JudgePhase::Observing);
            return self.resolve_final(step, baseline, Trigger::Settled, phases, cancel).await;
        }

        // Subscription lives only while the judge is armed or observing.
        let mut events = self.input.subscribe();
        let deadline = Instant::now() + self.cfg.judge_timeout;
        let mut events_open = true;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(AssistError::UserAbandoned("cancelled while judging".into()));
                }
                _ = sleep_until(deadline) => {
                    phases.push(JudgePhase::Timeout);
                    info!(step = %step.friendly_description(), "no user input before timeout, checking screen");
                    return self.resolve_final(step, baseline, Trigger::Timeout, phases, cancel).await;
                }
                ev = events.next(), if events_open => {
                    let Some(ev) = ev else {
                        debug!("input subscription ended; waiting for timeout");
                        events_open = false;
                        continue;
                    };
                    phases.push(JudgePhase::Observing);
                    let observed = tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(AssistError::UserAbandoned("cancelled while judging".into()));
                        }
                        res = self.observe() => res,
                    };
                    match observed {
                        Ok((shot, screen)) => match assess(step, baseline, &screen, Trigger::UserInput(&ev)) {
                            Assessment::Resolved(outcome) => {
                                phases.push(JudgePhase::Resolved);
                                return Ok(Judgement { outcome, screen, screenshot: Some(shot), phases });
                            }
                            Assessment::KeepWaiting => phases.push(JudgePhase::Armed),
                        },
                        Err(e) => {
                            warn!(error = %e, "observation after input failed");
                            phases.push(JudgePhase::Armed);
                        }
                    }
                }
            }
        }
    }

    async fn resolve_final(
        &self,
        step: &Step,
        baseline: &ScreenClassification,
        trigger: Trigger<'_>,
        mut phases: Vec<JudgePhase>,
        cancel: &CancellationToken,
    ) -> Result<Judgement, AssistError> {
        let observed = tokio::select! {
            _ = cancel.cancelled() => return Err(AssistError::UserAbandoned("cancelled while judging".into())),
            res = self.observe() => res,
        };
        phases.push(JudgePhase::Resolved);
        let judgement = match observed {
            Ok((shot, screen)) => {
                let outcome = match assess(step, baseline, &screen, trigger) {
                    Assessment::Resolved(o) => o,
                    Assessment::KeepWaiting => StepOutcome::failed(0.2, "no change on screen"),
                };
                Judgement { outcome, screen, screenshot: Some(shot), phases }
            }
            Err(e) => Judgement {
                outcome: StepOutcome::failed(0.1, format!("could not check the screen: {}", e)),
                screen: baseline.clone(),
                screenshot: None,
                phases,
            },
        };
        debug!(outcome = ?judgement.outcome.outcome, confidence = judgement.outcome.confidence, "step judged");
        Ok(judgement)
    }

    async fn observe(&self) -> Result<(Screenshot, ScreenClassification), AssistError> {
        let limit = self.cfg.collaborator_timeout;
        let shot = bounded(limit, "capture", self.screen.capture()).await?;
        let screen = with_backoff(&self.cfg.retry, "classify_screen", || {
            bounded(limit, "classify_screen", self.classifier.classify_screen(&shot))
        })
        .await?;
        Ok((shot, screen))
    }

    /// Checks the intent's goal against the latest screen, independent of the procedure.
    pub fn task_goal_reached(&self, task: &Task, latest: &ScreenClassification) -> bool {
        match &task.intent {
            Some(intent) => goal_satisfied(&intent.predicate, &intent.goal, latest),
            None => false,
        }
    }
}
