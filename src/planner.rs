use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capabilities::{LanguageModel, ModelPurpose, RawModelOutput, UnderstandRequest};
use crate::config::AssistConfig;
use crate::error::AssistError;
use crate::intent::SessionProfile;
use crate::judge::goal_satisfied;
use crate::retry::{bounded, with_backoff};
use crate::types::{Intent, Outcome, Procedure, ProcedureStep, ScreenClassification, Step, StepKind, Task};

#[derive(Clone, Debug, PartialEq)]
pub enum PlanDecision {
    /// `from_procedure` steps advance `step_index` once they succeed.
    Step { step: Step, from_procedure: bool },
    Complete,
    Failed(String),
}

#[derive(Debug, Deserialize)]
struct SynthesizedStep {
    #[serde(default)]
    thought: String,
    action: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    expected: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FreshPlan {
    #[serde(default)]
    title: Option<String>,
    steps: Vec<SynthesizedStep>,
}

const DONE_WORDS: &[&str] = &["done", "complete", "finish"];
const FAIL_WORDS: &[&str] = &["fail", "give_up"];

impl SynthesizedStep {
    /// Rejects actions the executor cannot carry out.
    fn check(self) -> Result<Self, AssistError> {
        let action = self.action.trim().to_lowercase();
        if DONE_WORDS.contains(&action.as_str()) || FAIL_WORDS.contains(&action.as_str()) {
            return Ok(self);
        }
        match StepKind::parse(&action) {
            Some(_) => Ok(self),
            None => Err(AssistError::CollaboratorUnavailable(format!(
                "unknown action in synthesized step: {}",
                self.action
            ))),
        }
    }

    fn into_procedure_step(self) -> Option<ProcedureStep> {
        let kind = StepKind::parse(&self.action)?;
        let mut ps = ProcedureStep::new(kind, self.target.trim());
        ps.input = self.text.filter(|t| !t.trim().is_empty());
        ps.expected = self.expected.filter(|e| !e.trim().is_empty());
        Some(ps)
    }
}

/// True when every precondition is visible in the observed screen.
pub fn preconditions_hold(step: &ProcedureStep, screen: &ScreenClassification) -> bool {
    step.preconditions.iter().all(|p| screen.mentions(p))
}

pub struct StepPlanner {
    llm: Arc<dyn LanguageModel>,
    cfg: AssistConfig,
}

impl StepPlanner {
    pub fn new(llm: Arc<dyn LanguageModel>, cfg: AssistConfig) -> Self {
        Self { llm, cfg }
    }

    /// Observe, think, act: one decision per call against the latest screen.
    pub async fn plan_next(
        &self,
        task: &Task,
        profile: &SessionProfile,
        screen: &ScreenClassification,
    ) -> Result<PlanDecision, AssistError> {
        let intent = task
            .intent
            .as_ref()
            .ok_or_else(|| AssistError::Internal("planning without a resolved intent".into()))?;

        if goal_satisfied(&intent.predicate, &intent.goal, screen) {
            info!(task_id = %task.id, goal = %intent.goal, "goal already visible on screen");
            return Ok(PlanDecision::Complete);
        }

        if let Some(procedure) = &task.procedure {
            if let Some(next) = procedure.steps.get(task.step_index) {
                if preconditions_hold(next, screen) {
                    return Ok(PlanDecision::Step { step: next.to_step(), from_procedure: true });
                }
                debug!(
                    step_index = task.step_index,
                    preconditions = ?next.preconditions,
                    "preconditions unmet, synthesizing"
                );
            } else if !procedure.is_empty() && intent.predicate.is_empty() {
                // Without an explicit predicate a finished procedure is the only completion signal.
                return Ok(PlanDecision::Complete);
            }
        }

        let prompt = self.synthesis_prompt(task, intent, screen);
        let proposed = self
            .ask(ModelPurpose::StepSynthesis, prompt, profile, |out| {
                out.parse_json::<SynthesizedStep>()?.check()
            })
            .await?;
        debug!(thought = %proposed.thought, action = %proposed.action, "step synthesized");
        match proposed.action.trim().to_lowercase().as_str() {
            a if DONE_WORDS.contains(&a) => {
                if intent.predicate.is_empty() {
                    return Ok(PlanDecision::Complete);
                }
                warn!(task_id = %task.id, "model reported done but goal is not on screen");
                Ok(PlanDecision::Step { step: fallback_step(intent, screen), from_procedure: false })
            }
            a if FAIL_WORDS.contains(&a) => Ok(PlanDecision::Failed(if proposed.thought.is_empty() {
                "no way forward from this screen".into()
            } else {
                proposed.thought
            })),
            other => {
                let action = other.to_string();
                let ps = proposed.into_procedure_step().ok_or_else(|| {
                    AssistError::CollaboratorUnavailable(format!("unknown action in synthesized step: {}", action))
                })?;
                Ok(PlanDecision::Step { step: ps.to_step(), from_procedure: false })
            }
        }
    }

    /// Fresh plan conditioned on the failure reason; the caller installs it.
    pub async fn replan(
        &self,
        task: &Task,
        profile: &SessionProfile,
        reason: &str,
        screen: &ScreenClassification,
    ) -> Result<Procedure, AssistError> {
        let intent = task
            .intent
            .as_ref()
            .ok_or_else(|| AssistError::Internal("replanning without a resolved intent".into()))?;
        let prompt = self.replan_prompt(task, intent, reason, screen);
        let plan: FreshPlan = self.ask(ModelPurpose::Replan, prompt, profile, |out| out.parse_json()).await?;
        let mut steps = Vec::with_capacity(plan.steps.len());
        for s in plan.steps {
            let action = s.action.clone();
            match s.into_procedure_step() {
                Some(ps) => steps.push(ps),
                None => warn!(action = %action, "dropping unknown action from fresh plan"),
            }
        }
        let title = plan.title.unwrap_or_else(|| format!("{} (replanned)", intent.goal));
        info!(task_id = %task.id, steps = steps.len(), reason = %reason, "fresh plan ready");
        Ok(Procedure::new(title, steps))
    }

    /// Output that does not parse is retried the same way as a failed call.
    async fn ask<T, F>(
        &self,
        purpose: ModelPurpose,
        prompt: String,
        profile: &SessionProfile,
        accept: F,
    ) -> Result<T, AssistError>
    where
        F: Fn(&RawModelOutput) -> Result<T, AssistError>,
    {
        let req = &UnderstandRequest { purpose, text: prompt, profile: profile.clone() };
        let accept = &accept;
        with_backoff(&self.cfg.retry, "understand", move || async move {
            let out = bounded(self.cfg.collaborator_timeout, "understand", self.llm.understand(req)).await?;
            accept(&out)
        })
        .await
    }

    fn synthesis_prompt(&self, task: &Task, intent: &Intent, screen: &ScreenClassification) -> String {
        let mut p = goal_block(intent);
        p.push_str(&screen_block(screen));
        p.push_str(&history_block(task));
        if let Some(err) = &task.last_failure {
            p.push_str(&format!("Last problem: {}\n", err));
        }
        for note in &task.feedback_notes {
            p.push_str(&format!("The user said: {}\n", note));
        }
        p.push_str(
            "\nRules: only answer done when the screen already shows the goal. \
             If the target app is not open yet, open it first.\n\
             Return only JSON: {\"thought\": \"...\", \"action\": \"click|type|key|wait|open_app|query|done|fail\", \
             \"target\": \"element or app\", \"text\": \"text to type or key to press\", \
             \"expected\": \"what should appear afterwards\"}",
        );
        p
    }

    fn replan_prompt(&self, task: &Task, intent: &Intent, reason: &str, screen: &ScreenClassification) -> String {
        let mut p = goal_block(intent);
        p.push_str(&screen_block(screen));
        p.push_str(&history_block(task));
        p.push_str(&format!("The previous plan stopped working: {}\n", reason));
        for note in &task.feedback_notes {
            p.push_str(&format!("The user said: {}\n", note));
        }
        p.push_str(
            "\nPlan the remaining steps from the current screen. \
             Return only JSON: {\"title\": \"...\", \"steps\": [{\"action\": \"click|type|key|wait|open_app|query\", \
             \"target\": \"...\", \"text\": null, \"expected\": null}]}",
        );
        p
    }
}

/// Used when the model claims completion the screen does not show.
fn fallback_step(intent: &Intent, screen: &ScreenClassification) -> Step {
    match intent.predicate.target_app.as_deref() {
        Some(app) if !crate::judge::app_matches(&screen.app, app) => Step::new(StepKind::OpenApp, app),
        _ => Step::new(StepKind::Wait, "screen to update"),
    }
}

fn goal_block(intent: &Intent) -> String {
    let mut s = format!("Goal: {} ({})\n", intent.normalized_text, intent.goal);
    if let Some(app) = &intent.predicate.target_app {
        s.push_str(&format!("Target app: {}\n", app));
    }
    if let Some(state) = &intent.predicate.target_state {
        s.push_str(&format!("Done when: {}\n", state));
    }
    if !intent.predicate.success_criteria.is_empty() {
        s.push_str(&format!("Success criteria: {}\n", intent.predicate.success_criteria.join(", ")));
    }
    s
}

fn screen_block(screen: &ScreenClassification) -> String {
    format!(
        "Current screen: app={} page={} status={:?}\nElements: {}\n",
        screen.app,
        screen.page_state,
        screen.page_status,
        screen.elements.join(" | ")
    )
}

fn history_block(task: &Task) -> String {
    if task.history.is_empty() {
        return "This is the first step.\n".into();
    }
    let mut s = String::from("Steps so far:\n");
    let skip = task.history.len().saturating_sub(5);
    for (i, r) in task.history.iter().enumerate().skip(skip) {
        let mark = match r.outcome {
            Outcome::Success => "ok",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        };
        s.push_str(&format!("{}. {} [{}] {}\n", i + 1, r.step.friendly_description(), mark, r.note));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GoalPredicate;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct Canned(Mutex<Vec<String>>);

    #[async_trait]
    impl LanguageModel for Canned {
        async fn understand(&self, _r: &UnderstandRequest) -> Result<RawModelOutput, AssistError> {
            let mut v = self.0.lock().unwrap();
            if v.is_empty() {
                return Err(AssistError::Internal("no reply scripted".into()));
            }
            Ok(RawModelOutput::new(v.remove(0)))
        }
    }

    fn planner(replies: &[&str]) -> StepPlanner {
        let llm = Arc::new(Canned(Mutex::new(replies.iter().map(|s| s.to_string()).collect())));
        StepPlanner::new(llm, AssistConfig::default())
    }

    fn task_with(predicate: GoalPredicate, procedure: Option<Procedure>) -> Task {
        let mut task = Task::new("s", "帮我打开微信");
        task.intent = Some(Intent {
            raw_text: "帮我打开微信".into(),
            normalized_text: "想打开微信".into(),
            goal: "open_app".into(),
            entities: BTreeMap::new(),
            confidence: 0.9,
            ambiguous: false,
            predicate,
        });
        task.install_procedure(procedure);
        task
    }

    fn desktop() -> ScreenClassification {
        ScreenClassification { app: "桌面".into(), page_state: "desktop".into(), is_desktop: true, ..Default::default() }
    }

    fn wechat() -> GoalPredicate {
        GoalPredicate { target_app: Some("微信".into()), ..Default::default() }
    }

    #[tokio::test]
    async fn next_procedure_step_when_preconditions_hold() {
        let proc = Procedure::new(
            "打开微信",
            vec![ProcedureStep::new(StepKind::OpenApp, "微信").with_precondition("desktop")],
        );
        let task = task_with(wechat(), Some(proc));
        let d = planner(&[]).plan_next(&task, &SessionProfile::default(), &desktop()).await.unwrap();
        assert!(matches!(d, PlanDecision::Step { from_procedure: true, ref step } if step.kind == StepKind::OpenApp));
    }

    #[tokio::test]
    async fn goal_on_screen_completes_early() {
        let task = task_with(wechat(), None);
        let screen = ScreenClassification { app: "微信".into(), page_state: "chat list".into(), ..Default::default() };
        let d = planner(&[]).plan_next(&task, &SessionProfile::default(), &screen).await.unwrap();
        assert_eq!(d, PlanDecision::Complete);
    }

    #[tokio::test]
    async fn unmet_precondition_falls_back_to_synthesis() {
        let proc = Procedure::new(
            "发消息",
            vec![ProcedureStep::new(StepKind::Click, "发送").with_precondition("聊天窗口")],
        );
        let task = task_with(wechat(), Some(proc));
        let p = planner(&[r#"{"thought":"先打开微信","action":"open_app","target":"微信"}"#]);
        let d = p.plan_next(&task, &SessionProfile::default(), &desktop()).await.unwrap();
        assert!(matches!(d, PlanDecision::Step { from_procedure: false, ref step } if step.target_description == "微信"));
    }

    #[tokio::test]
    async fn premature_done_is_overridden() {
        let task = task_with(wechat(), None);
        let p = planner(&[r#"{"thought":"好了","action":"done"}"#]);
        let d = p.plan_next(&task, &SessionProfile::default(), &desktop()).await.unwrap();
        assert!(matches!(d, PlanDecision::Step { ref step, .. } if step.kind == StepKind::OpenApp));
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_synthesis_is_asked_again() {
        let task = task_with(wechat(), None);
        let p = planner(&[
            "let me think about it",
            r#"{"thought":"往下翻","action":"scroll","target":"页面"}"#,
            r#"{"thought":"先打开微信","action":"open_app","target":"微信"}"#,
        ]);
        let d = p.plan_next(&task, &SessionProfile::default(), &desktop()).await.unwrap();
        assert!(matches!(d, PlanDecision::Step { ref step, .. } if step.kind == StepKind::OpenApp));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_action_surfaces_once_retries_run_out() {
        let task = task_with(wechat(), None);
        let scroll = r#"{"action":"scroll","target":"页面"}"#;
        let p = planner(&[scroll, scroll, scroll]);
        let err = p.plan_next(&task, &SessionProfile::default(), &desktop()).await.unwrap_err();
        assert!(matches!(err, AssistError::CollaboratorUnavailable(ref m) if m.contains("scroll")), "got {:?}", err);
    }

    #[tokio::test]
    async fn replan_builds_a_fresh_procedure() {
        let task = task_with(wechat(), None);
        let p = planner(&[
            concat!(
                r#"{"steps":[{"action":"click","target":"开始按钮"},{"action":"jump"},"#,
                r#"{"action":"type","target":"搜索框","text":"微信"}]}"#
            ),
        ]);
        let fresh = p.replan(&task, &SessionProfile::default(), "icon not found", &desktop()).await.unwrap();
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh.steps[1].input.as_deref(), Some("微信"));
    }
}
