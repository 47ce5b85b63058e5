//! Control loop: drives one task through the state machine.
//!
//! Every suspension point (collaborator calls, the judge's armed wait, user
//! replies) races the task's cancellation token. The screen lease is held
//! from grounding through judging of one step and released while waiting on
//! the user, so at most one step is ever in flight on the shared screen.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capabilities::{
    ElementLocator, InputDevice, InputMonitor, KnowledgeRetriever, LanguageModel, Notifier, ScreenCapture,
    ScreenClassifier, SilentInputMonitor, TracingNotifier,
};
use crate::config::AssistConfig;
use crate::error::{AssistError, FailureReport};
use crate::executor::ActionExecutor;
use crate::grounding::{Grounding, GroundingStage};
use crate::intent::{IntentResolver, SessionProfile};
use crate::judge::{CompletionJudge, JudgePhase};
use crate::planner::{PlanDecision, StepPlanner};
use crate::retry::{bounded, with_backoff};
use crate::safety::{user_message, SafetyDecision, SafetyGate};
use crate::snapshots::{NullSnapshotStore, Phase, SnapshotStore};
use crate::types::{
    now_ms, Intent, Outcome, Procedure, ScreenClassification, Screenshot, Severity, Step, StepOutcome, StepRecord,
    Task, TaskSnapshot, TaskState,
};

// ========================= Wiring =========================

/// Everything outside the control loop, behind capability traits.
#[derive(Clone)]
pub struct Collaborators {
    pub llm: Arc<dyn LanguageModel>,
    pub classifier: Arc<dyn ScreenClassifier>,
    pub locator: Arc<dyn ElementLocator>,
    pub knowledge: Arc<dyn KnowledgeRetriever>,
    pub screen: Arc<dyn ScreenCapture>,
    pub device: Arc<dyn InputDevice>,
    pub input: Arc<dyn InputMonitor>,
    pub notifier: Arc<dyn Notifier>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

impl Collaborators {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        classifier: Arc<dyn ScreenClassifier>,
        locator: Arc<dyn ElementLocator>,
        knowledge: Arc<dyn KnowledgeRetriever>,
        screen: Arc<dyn ScreenCapture>,
        device: Arc<dyn InputDevice>,
    ) -> Self {
        Self {
            llm,
            classifier,
            locator,
            knowledge,
            screen,
            device,
            input: Arc::new(SilentInputMonitor),
            notifier: Arc::new(TracingNotifier),
            snapshots: Arc::new(NullSnapshotStore),
        }
    }

    pub fn with_input_monitor(mut self, input: Arc<dyn InputMonitor>) -> Self {
        self.input = input;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = store;
        self
    }
}

/// Per-task handles owned by the session layer.
pub struct TaskContext {
    pub profile: SessionProfile,
    /// Session feedback queue; the running task is its only consumer.
    pub feedback: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    pub updates: watch::Sender<TaskSnapshot>,
    pub cancel: CancellationToken,
}

struct Run<'a> {
    task: Task,
    profile: &'a SessionProfile,
    feedback: &'a mut mpsc::UnboundedReceiver<String>,
    updates: &'a watch::Sender<TaskSnapshot>,
    cancel: &'a CancellationToken,
}

enum StepEnd {
    Continue,
    Completed,
}

/// Picks a disambiguation candidate from a reply: by number ("2", "第二个") or by text.
pub fn pick_candidate(reply: &str, candidates: &[String]) -> Option<String> {
    let reply = reply.trim();
    if reply.is_empty() || candidates.is_empty() {
        return None;
    }
    let digits: String = reply.chars().filter(|c| c.is_ascii_digit()).collect();
    if let Ok(n) = digits.parse::<usize>() {
        if (1..=candidates.len()).contains(&n) {
            return Some(candidates[n - 1].clone());
        }
    }
    const NUMERALS: [&str; 9] = ["一", "二", "三", "四", "五", "六", "七", "八", "九"];
    for (i, n) in NUMERALS.iter().enumerate().take(candidates.len()) {
        if reply == *n || reply.contains(&format!("第{}", n)) {
            return Some(candidates[i].clone());
        }
    }
    let lower = reply.to_lowercase();
    let hits: Vec<&String> = candidates
        .iter()
        .filter(|c| {
            let c = c.trim().to_lowercase();
            !c.is_empty() && (c.contains(&lower) || lower.contains(&c))
        })
        .collect();
    match hits.as_slice() {
        [one] => Some((*one).clone()),
        _ => None,
    }
}

fn report_for(task: &Task, err: &AssistError) -> FailureReport {
    match (err, &task.last_failure) {
        (AssistError::ReplanExhausted(msg), Some(last)) => {
            FailureReport::with_kind(last.kind(), format!("{} (last problem: {})", msg, last))
        }
        _ => FailureReport::from_error(err),
    }
}

// ========================= Orchestrator =========================

pub struct Orchestrator {
    resolver: IntentResolver,
    planner: StepPlanner,
    grounding: GroundingStage,
    executor: ActionExecutor,
    judge: CompletionJudge,
    safety: SafetyGate,
    knowledge: Arc<dyn KnowledgeRetriever>,
    screen: Arc<dyn ScreenCapture>,
    notifier: Arc<dyn Notifier>,
    snapshots: Arc<dyn SnapshotStore>,
    screen_lease: Mutex<()>,
    cfg: AssistConfig,
}

impl Orchestrator {
    pub fn new(collab: Collaborators, cfg: AssistConfig) -> Self {
        Self {
            resolver: IntentResolver::new(collab.llm.clone(), cfg.clone()),
            planner: StepPlanner::new(collab.llm.clone(), cfg.clone()),
            grounding: GroundingStage::new(collab.classifier.clone(), collab.locator.clone(), cfg.clone()),
            executor: ActionExecutor::new(collab.screen.clone(), collab.device.clone(), cfg.clone()),
            judge: CompletionJudge::new(
                collab.screen.clone(),
                collab.classifier.clone(),
                collab.input.clone(),
                cfg.clone(),
            ),
            safety: SafetyGate::new(cfg.safety.clone()),
            knowledge: collab.knowledge,
            screen: collab.screen,
            notifier: collab.notifier,
            snapshots: collab.snapshots,
            screen_lease: Mutex::new(()),
            cfg,
        }
    }

    pub fn config(&self) -> &AssistConfig {
        &self.cfg
    }

    /// Runs `task` to a terminal state and returns its final snapshot. Never fails:
    /// errors become `Failed`, cancellation becomes `Abandoned`.
    pub async fn run(&self, task: Task, ctx: &TaskContext) -> TaskSnapshot {
        let mut feedback = ctx.feedback.lock().await;
        while let Ok(stale) = feedback.try_recv() {
            debug!(message = %stale, "dropping feedback sent before this task");
        }
        let mut run = Run {
            task,
            profile: &ctx.profile,
            feedback: &mut *feedback,
            updates: &ctx.updates,
            cancel: &ctx.cancel,
        };
        run.updates.send_replace(run.task.snapshot());

        let result = self.drive(&mut run).await;
        let task = &mut run.task;
        task.in_flight = None;
        if let Err(err) = result {
            let next = match &err {
                AssistError::UserAbandoned(reason) => TaskState::Abandoned { reason: reason.clone() },
                other => TaskState::Failed { report: report_for(task, other) },
            };
            if let TaskState::Failed { report } = &next {
                warn!(task_id = %task.id, kind = ?report.kind, error = %err, "task failed");
                self.notifier.notify_user(&report.recovery_suggestion, Severity::Warning).await;
            } else {
                info!(task_id = %task.id, reason = %err, "task abandoned");
            }
            if let Err(e) = task.transition(next) {
                warn!(task_id = %task.id, error = %e, "could not record terminal state");
            }
        }
        let snapshot = task.snapshot();
        run.updates.send_replace(snapshot.clone());
        snapshot
    }

    async fn drive(&self, run: &mut Run<'_>) -> Result<(), AssistError> {
        self.set(run, TaskState::Resolving)?;
        let intent = self.resolve_intent(run).await?;
        run.task.intent = Some(intent.clone());
        self.set(run, TaskState::Planning)?;

        // Capture and retrieval are independent; issue both at once.
        let limit = self.cfg.collaborator_timeout;
        let (shot, procedures) = cancellable(run.cancel, async {
            let capture = bounded(limit, "capture", self.screen.capture());
            let retrieve = with_backoff(&self.cfg.retry, "retrieve_procedures", || {
                bounded(limit, "retrieve_procedures", self.knowledge.retrieve_procedures(&intent))
            });
            Ok(tokio::join!(capture, retrieve))
        })
        .await?;
        let procedure = match procedures {
            Ok(list) => self.select_procedure(list.into_iter().map(|s| (s.procedure, s.confidence)).collect()).await,
            Err(e) => {
                warn!(task_id = %run.task.id, error = %e, "knowledge retrieval failed; planning from the screen");
                None
            }
        };
        if let Some(p) = &procedure {
            info!(task_id = %run.task.id, procedure = %p.title, steps = p.len(), "procedure selected");
        }
        run.task.install_procedure(procedure);
        self.publish(run);

        let mut pending_shot = shot.ok();
        loop {
            self.drain_feedback(run)?;
            if run.task.steps_attempted >= self.cfg.max_steps {
                return Err(AssistError::StepBudgetExhausted(run.task.steps_attempted));
            }
            let (shot, decision) = match self.plan(run, pending_shot.take()).await {
                Ok(planned) => planned,
                Err(e @ AssistError::UserAbandoned(_)) => return Err(e),
                Err(e) => {
                    self.on_failure(run, e, false).await?;
                    continue;
                }
            };
            match decision {
                PlanDecision::Complete => return self.complete(run).await,
                PlanDecision::Failed(reason) => return Err(AssistError::ReplanExhausted(reason)),
                PlanDecision::Step { step, from_procedure } => {
                    if let StepEnd::Completed = self.attempt_step(run, step, from_procedure, shot).await? {
                        return self.complete(run).await;
                    }
                }
            }
        }
    }

    /// Observes the screen and asks the planner for the next decision.
    async fn plan(&self, run: &Run<'_>, shot: Option<Screenshot>) -> Result<(Screenshot, PlanDecision), AssistError> {
        let shot = match shot {
            Some(s) => s,
            None => self.capture(run.cancel).await?,
        };
        let screen = cancellable(run.cancel, self.grounding.classify(&shot)).await?;
        let decision = cancellable(run.cancel, self.planner.plan_next(&run.task, run.profile, &screen)).await?;
        Ok((shot, decision))
    }

    async fn resolve_intent(&self, run: &mut Run<'_>) -> Result<Intent, AssistError> {
        let mut utterance = run.task.raw_input.clone();
        let mut asked = 0;
        loop {
            let intent = cancellable(run.cancel, self.resolver.resolve(&utterance, run.profile)).await?;
            if !intent.ambiguous {
                return Ok(intent);
            }
            if asked >= self.cfg.max_clarifications {
                return Err(AssistError::Ambiguous(format!(
                    "still unclear after {} clarifications (confidence {:.2})",
                    asked, intent.confidence
                )));
            }
            asked += 1;
            let prompt = "Could you say a little more about what you would like to do?".to_string();
            self.set(run, TaskState::Disambiguation { prompt: prompt.clone(), candidates: Vec::new() })?;
            self.notifier.notify_user(&prompt, Severity::Info).await;
            let reply = self.wait_reply(run).await?;
            utterance = format!("{} {}", utterance, reply);
            self.set(run, TaskState::Resolving)?;
        }
    }

    async fn select_procedure(&self, candidates: Vec<(Procedure, f32)>) -> Option<Procedure> {
        for (procedure, confidence) in candidates {
            if confidence < self.cfg.procedure_confidence_threshold {
                continue;
            }
            if let SafetyDecision::Block(reason) = self.safety.check_content(&procedure.text()) {
                warn!(procedure = %procedure.title, reason = %reason, "retrieved procedure looks like a scam");
                self.notifier
                    .notify_user("A guide that looked unsafe was skipped.", Severity::Warning)
                    .await;
                continue;
            }
            return Some(procedure);
        }
        None
    }

    /// Grounding -> Safety -> Executing -> Judging for one step, strictly in order.
    async fn attempt_step(
        &self,
        run: &mut Run<'_>,
        mut step: Step,
        from_procedure: bool,
        mut shot: Screenshot,
    ) -> Result<StepEnd, AssistError> {
        self.set(run, TaskState::Grounding)?;
        let mut lease = Some(self.lease(run.cancel).await?);
        let mut confirmed = false;

        let baseline: ScreenClassification = loop {
            let report = match cancellable(run.cancel, self.grounding.ground(&mut step, &shot)).await {
                Ok(r) => r,
                Err(e @ AssistError::UserAbandoned(_)) => return Err(e),
                Err(e) => {
                    drop(lease.take());
                    self.record(run, &step, (None, None), StepOutcome::failed(0.0, e.to_string()));
                    self.on_failure(run, e, false).await?;
                    return Ok(StepEnd::Continue);
                }
            };
            match report.result {
                Grounding::NotFound(reason) => {
                    drop(lease.take());
                    self.record(run, &step, (Some(shot.id.clone()), None), StepOutcome::failed(0.0, reason.clone()));
                    self.on_failure(run, AssistError::GroundingNotFound(reason), false).await?;
                    return Ok(StepEnd::Continue);
                }
                Grounding::Disambiguation(candidates) => {
                    drop(lease.take());
                    let prompt = format!(
                        "Which one do you mean? {}",
                        candidates
                            .iter()
                            .enumerate()
                            .map(|(i, c)| format!("{}. {}", i + 1, c))
                            .collect::<Vec<_>>()
                            .join("  ")
                    );
                    let asking = TaskState::Disambiguation { prompt: prompt.clone(), candidates: candidates.clone() };
                    self.set(run, asking)?;
                    self.notifier.notify_user(&prompt, Severity::Info).await;
                    let reply = self.wait_reply(run).await?;
                    match pick_candidate(&reply, &candidates) {
                        Some(choice) => {
                            info!(task_id = %run.task.id, choice = %choice, "user picked a candidate");
                            step.target_description = choice;
                            // A confirmation covers the target the user saw, not the new one.
                            confirmed = false;
                            self.set(run, TaskState::Grounding)?;
                            lease = Some(self.lease(run.cancel).await?);
                            shot = self.capture(run.cancel).await?;
                            continue;
                        }
                        None => {
                            run.task.feedback_notes.push(reply.clone());
                            let outcome = StepOutcome::skipped(format!("unclear choice: {}", reply));
                            self.record(run, &step, (None, None), outcome);
                            let err = AssistError::Ambiguous(format!("could not match \"{}\" to a candidate", reply));
                            self.on_failure(run, err, false).await?;
                            return Ok(StepEnd::Continue);
                        }
                    }
                }
                Grounding::Resolved(_) => {}
            }

            if !confirmed {
                let intent = run.task.intent.clone();
                match self.safety.check(&step, intent.as_ref()) {
                    SafetyDecision::Allow => {}
                    SafetyDecision::Block(reason) => {
                        drop(lease.take());
                        if let Some(msg) = user_message(&SafetyDecision::Block(reason.clone())) {
                            self.notifier.notify_user(&msg, Severity::Critical).await;
                        }
                        self.record(run, &step, (Some(shot.id.clone()), None), StepOutcome::skipped(reason.clone()));
                        self.on_failure(run, AssistError::SafetyBlocked(reason), true).await?;
                        return Ok(StepEnd::Continue);
                    }
                    SafetyDecision::RequireConfirmation(reason) => {
                        drop(lease.take());
                        self.set(run, TaskState::AwaitingConfirmation { reason: reason.clone() })?;
                        if let Some(msg) = user_message(&SafetyDecision::RequireConfirmation(reason)) {
                            self.notifier.notify_user(&msg, Severity::Warning).await;
                        }
                        self.wait_confirmation(run).await?;
                        confirmed = true;
                        lease = Some(self.lease(run.cancel).await?);
                    }
                }
            }

            // A coordinate is only good for the resolution it was resolved against.
            if let Some(target) = &step.resolved_target {
                let fresh = self.capture(run.cancel).await?;
                if !target.is_valid_for(&fresh) {
                    info!(
                        task_id = %run.task.id,
                        from = ?target.screen,
                        to = ?fresh.resolution(),
                        "screen changed, grounding again"
                    );
                    self.set(run, TaskState::Grounding)?;
                    shot = fresh;
                    continue;
                }
            }
            break report.screen;
        };

        self.set(run, TaskState::Executing)?;
        run.task.in_flight = Some(step.clone());
        self.publish(run);
        let receipt = match cancellable(run.cancel, self.executor.execute(&mut step)).await {
            Ok(r) => r,
            Err(e @ AssistError::UserAbandoned(_)) => return Err(e),
            Err(e) => {
                drop(lease.take());
                run.task.in_flight = None;
                self.record(run, &step, (None, None), StepOutcome::failed(0.0, e.to_string()));
                self.on_failure(run, e, false).await?;
                return Ok(StepEnd::Continue);
            }
        };
        run.task.steps_attempted += 1;
        let index = run.task.history.len();
        let before_ref = self.save_shot(&run.task.id, index, Phase::Before, &receipt.screenshot_before).await;

        self.set(run, TaskState::Judging)?;
        run.task.in_flight = Some(step.clone());
        let judgement = self.judge.judge(&step, &receipt, &baseline, run.cancel).await?;
        let after_shot = judgement.screenshot.as_ref().unwrap_or(&receipt.screenshot_after);
        let after_ref = self.save_shot(&run.task.id, index, Phase::After, after_shot).await;
        drop(lease.take());
        run.task.in_flight = None;

        let outcome = judgement.outcome;
        info!(
            task_id = %run.task.id,
            step = %step.friendly_description(),
            outcome = ?outcome.outcome,
            confidence = outcome.confidence,
            "step judged"
        );
        self.record(run, &step, (before_ref, after_ref), outcome.clone());

        if outcome.outcome == Outcome::Success {
            run.task.consecutive_failures = 0;
            run.task.last_failure = None;
            if from_procedure {
                run.task.advance();
            }
            if self.judge.task_goal_reached(&run.task, &judgement.screen) {
                return Ok(StepEnd::Completed);
            }
            self.set(run, TaskState::Planning)?;
            return Ok(StepEnd::Continue);
        }

        if judgement.phases.contains(&JudgePhase::Timeout) {
            self.notifier
                .notify_user("Nothing seemed to change on the screen. The assistant will try again.", Severity::Info)
                .await;
        }
        let err = AssistError::GroundingNotFound(format!(
            "{} had no visible effect: {}",
            step.friendly_description(),
            outcome.reason
        ));
        self.on_failure(run, err, false).await?;
        Ok(StepEnd::Continue)
    }

    /// Counts a step failure and replans when the policy says so. Errors only
    /// when the replan bound is exceeded or the task is cancelled.
    async fn on_failure(&self, run: &mut Run<'_>, err: AssistError, force_replan: bool) -> Result<(), AssistError> {
        let task = &mut run.task;
        task.consecutive_failures += 1;
        task.last_failure = Some(err.clone());
        warn!(
            task_id = %task.id,
            error = %err,
            consecutive = task.consecutive_failures,
            replans = task.replan_count,
            "step failed"
        );
        if !force_replan && task.consecutive_failures < self.cfg.failures_before_replan {
            return self.set(run, TaskState::Planning);
        }
        if run.task.replan_count >= self.cfg.max_replans {
            return Err(AssistError::ReplanExhausted(format!("gave up after {} replans", run.task.replan_count)));
        }
        run.task.replan_count += 1;
        run.task.consecutive_failures = 0;
        self.set(run, TaskState::Planning)?;
        self.notifier.notify_user("Trying another way.", Severity::Info).await;

        let fresh = match self.observe(run.cancel).await {
            Ok(screen) => {
                cancellable(run.cancel, self.planner.replan(&run.task, run.profile, &err.to_string(), &screen)).await
            }
            Err(e) => Err(e),
        };
        match fresh {
            Ok(p) => run.task.install_procedure(Some(p)),
            Err(e @ AssistError::UserAbandoned(_)) => return Err(e),
            Err(e) => {
                warn!(task_id = %run.task.id, error = %e, "replanning failed; continuing step by step");
                run.task.install_procedure(None);
            }
        }
        info!(task_id = %run.task.id, replan = run.task.replan_count, "replanned");
        self.publish(run);
        Ok(())
    }

    async fn complete(&self, run: &mut Run<'_>) -> Result<(), AssistError> {
        self.set(run, TaskState::Completed)?;
        let goal = run.task.intent.as_ref().map(|i| i.goal.clone()).unwrap_or_default();
        self.notifier.notify_user(&format!("Done: {}", goal), Severity::Info).await;
        Ok(())
    }

    // ========================= Helpers =========================

    fn set(&self, run: &mut Run<'_>, next: TaskState) -> Result<(), AssistError> {
        if run.task.state == next && matches!(next, TaskState::Planning | TaskState::Grounding) {
            return Ok(());
        }
        run.task.transition(next)?;
        info!(
            task_id = %run.task.id,
            state = run.task.state.name(),
            step_index = run.task.step_index,
            "task state"
        );
        self.publish(run);
        Ok(())
    }

    fn publish(&self, run: &Run<'_>) {
        run.updates.send_replace(run.task.snapshot());
    }

    fn record(&self, run: &mut Run<'_>, step: &Step, refs: (Option<String>, Option<String>), outcome: StepOutcome) {
        run.task.record(StepRecord {
            step: step.clone(),
            screenshot_before_ref: refs.0,
            screenshot_after_ref: refs.1,
            outcome: outcome.outcome,
            judge_confidence: outcome.confidence,
            note: outcome.reason,
            recorded_at_ms: now_ms(),
        });
        self.publish(run);
    }

    /// Queued feedback is only read here, between steps.
    fn drain_feedback(&self, run: &mut Run<'_>) -> Result<(), AssistError> {
        while let Ok(msg) = run.feedback.try_recv() {
            if self.cfg.feedback.is_cancel(&msg) {
                return Err(AssistError::UserAbandoned(format!("user said \"{}\"", msg)));
            }
            info!(task_id = %run.task.id, feedback = %msg, "feedback noted for planning");
            run.task.feedback_notes.push(msg);
        }
        Ok(())
    }

    async fn wait_reply(&self, run: &mut Run<'_>) -> Result<String, AssistError> {
        let msg = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(AssistError::UserAbandoned("cancelled".into())),
            msg = run.feedback.recv() => msg,
        };
        match msg {
            Some(m) if self.cfg.feedback.is_cancel(&m) => {
                Err(AssistError::UserAbandoned(format!("user said \"{}\"", m)))
            }
            Some(m) => Ok(m),
            None => Err(AssistError::UserAbandoned("session closed".into())),
        }
    }

    async fn wait_confirmation(&self, run: &mut Run<'_>) -> Result<(), AssistError> {
        loop {
            let reply = self.wait_reply(run).await?;
            if self.cfg.feedback.is_confirm(&reply) {
                info!(task_id = %run.task.id, "user confirmed sensitive step");
                return Ok(());
            }
            debug!(reply = %reply, "reply is neither confirm nor cancel; asking again");
            self.notifier
                .notify_user("Please say \"确认\" to continue or \"取消\" to stop.", Severity::Info)
                .await;
        }
    }

    async fn capture(&self, cancel: &CancellationToken) -> Result<Screenshot, AssistError> {
        let limit = self.cfg.collaborator_timeout;
        let attempt = || bounded(limit, "capture", self.screen.capture());
        cancellable(cancel, with_backoff(&self.cfg.retry, "capture", attempt)).await
    }

    async fn observe(&self, cancel: &CancellationToken) -> Result<ScreenClassification, AssistError> {
        let shot = self.capture(cancel).await?;
        cancellable(cancel, self.grounding.classify(&shot)).await
    }

    async fn lease(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, ()>, AssistError> {
        cancellable(cancel, async { Ok(self.screen_lease.lock().await) }).await
    }

    async fn save_shot(&self, task_id: &str, index: usize, phase: Phase, shot: &Screenshot) -> Option<String> {
        match self.snapshots.save(task_id, index, phase, shot).await {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(task_id, error = %e, "could not store screenshot");
                Some(shot.id.clone())
            }
        }
    }
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, AssistError>
where
    F: Future<Output = Result<T, AssistError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AssistError::UserAbandoned("cancelled".into())),
        res = fut => res,
    }
}
