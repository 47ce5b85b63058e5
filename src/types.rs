use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{AssistError, FailureReport};

pub type TaskId = String;
pub type SessionId = String;

pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

// ========================= Screen =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub app: String,
    pub title: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Screenshot {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub image_base64: Option<String>,
    pub active_window: Option<WindowInfo>,
    pub captured_at_ms: u128,
}

impl Screenshot {
    pub fn new(width: u32, height: u32, image_base64: Option<String>, active_window: Option<WindowInfo>) -> Self {
        Self {
            id: nanoid!(),
            width,
            height,
            image_base64,
            active_window,
            captured_at_ms: now_ms(),
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    #[default]
    Normal,
    Loading,
    Error,
    Dialog,
    Login,
    Unknown,
}

/// Light-tier view of a screen: what app is up and which elements exist, no coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct ScreenClassification {
    pub app: String,
    pub page_state: String,
    #[serde(default)]
    pub page_status: PageStatus,
    #[serde(default)]
    pub elements: Vec<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_desktop: bool,
}

impl ScreenClassification {
    /// Lowercased haystack of everything the classifier reported.
    pub fn haystack(&self) -> String {
        let mut s = format!("{} {}", self.app, self.page_state);
        for e in &self.elements {
            s.push(' ');
            s.push_str(e);
        }
        if let Some(t) = &self.text {
            s.push(' ');
            s.push_str(t);
        }
        s.to_lowercase()
    }

    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        !needle.is_empty() && self.haystack().contains(&needle)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Light,
    Heavy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: i64,
    pub y: i64,
    pub source_tier: Tier,
    /// Resolution of the screenshot the coordinate was resolved against.
    pub screen: (u32, u32),
}

impl Coordinate {
    pub fn is_valid_for(&self, shot: &Screenshot) -> bool {
        self.screen == shot.resolution()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl BoundingBox {
    pub fn center(&self) -> (i64, i64) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }

    pub fn is_well_formed(&self) -> bool {
        self.x2 > self.x1 && self.y2 > self.y1 && self.x1 >= 0 && self.y1 >= 0
    }
}

// ========================= Input events =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEventKind {
    MouseClick { x: i64, y: i64 },
    KeyPress { key: String },
    Scroll { dy: i64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    pub kind: InputEventKind,
    pub at_ms: u128,
}

impl InputEvent {
    pub fn click(x: i64, y: i64) -> Self {
        Self { kind: InputEventKind::MouseClick { x, y }, at_ms: now_ms() }
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self { kind: InputEventKind::KeyPress { key: key.into() }, at_ms: now_ms() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

// ========================= Intent =========================

/// Explicit, intent-derived success criteria used for early termination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct GoalPredicate {
    pub target_app: Option<String>,
    pub target_state: Option<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

impl GoalPredicate {
    pub fn is_empty(&self) -> bool {
        self.target_app.as_deref().map_or(true, |s| s.trim().is_empty())
            && self.target_state.as_deref().map_or(true, |s| s.trim().is_empty())
            && self.success_criteria.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub raw_text: String,
    /// Perspective-taking restatement of the utterance.
    pub normalized_text: String,
    pub goal: String,
    pub entities: BTreeMap<String, String>,
    pub confidence: f32,
    pub ambiguous: bool,
    pub predicate: GoalPredicate,
}

// ========================= Procedures & steps =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Click,
    Type,
    Key,
    Wait,
    OpenApp,
    Query,
}

impl StepKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "click" | "double_click" | "tap" => Some(StepKind::Click),
            "type" | "input" => Some(StepKind::Type),
            "key" | "key_press" | "hotkey" | "keypress" => Some(StepKind::Key),
            "wait" | "wait_ms" => Some(StepKind::Wait),
            "open_app" | "open" | "launch" => Some(StepKind::OpenApp),
            "query" | "observe" => Some(StepKind::Query),
            _ => None,
        }
    }

    /// Click-class actions are the only ones that need a tier-2 coordinate.
    pub fn needs_coordinate(self) -> bool {
        matches!(self, StepKind::Click)
    }

    /// Non-interactive steps are judged after a settle delay instead of on user input.
    pub fn is_passive(self) -> bool {
        matches!(self, StepKind::Wait | StepKind::Query)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcedureStep {
    pub kind: StepKind,
    pub target_description: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
}

impl ProcedureStep {
    pub fn new(kind: StepKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target_description: target.into(),
            input: None,
            expected: None,
            preconditions: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_precondition(mut self, pre: impl Into<String>) -> Self {
        self.preconditions.push(pre.into());
        self
    }

    pub fn to_step(&self) -> Step {
        Step {
            kind: self.kind,
            target_description: self.target_description.clone(),
            input: self.input.clone(),
            expected: self.expected.clone(),
            resolved_target: None,
            attempt_count: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub id: String,
    pub title: String,
    pub steps: Vec<ProcedureStep>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Procedure {
    pub fn new(title: impl Into<String>, steps: Vec<ProcedureStep>) -> Self {
        Self { id: nanoid!(), title: title.into(), steps, keywords: Vec::new() }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// All human-readable text of the procedure, for content screening.
    pub fn text(&self) -> String {
        let mut s = self.title.clone();
        for st in &self.steps {
            s.push('\n');
            s.push_str(&st.target_description);
            if let Some(i) = &st.input {
                s.push(' ');
                s.push_str(i);
            }
        }
        s
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredProcedure {
    pub procedure: Procedure,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,
    pub target_description: String,
    pub input: Option<String>,
    pub expected: Option<String>,
    pub resolved_target: Option<Coordinate>,
    pub attempt_count: u32,
}

impl Step {
    pub fn new(kind: StepKind, target: impl Into<String>) -> Self {
        ProcedureStep::new(kind, target).to_step()
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn friendly_description(&self) -> String {
        match self.kind {
            StepKind::Click => format!("click \"{}\"", self.target_description),
            StepKind::Type => format!("type \"{}\"", self.input.as_deref().unwrap_or(&self.target_description)),
            StepKind::Key => format!("press {}", self.input.as_deref().unwrap_or(&self.target_description)),
            StepKind::Wait => "wait a moment".to_string(),
            StepKind::OpenApp => format!("open {}", self.target_description),
            StepKind::Query => format!("look for {}", self.target_description),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub outcome: Outcome,
    pub confidence: f32,
    pub reason: String,
}

impl StepOutcome {
    pub fn success(confidence: f32, reason: impl Into<String>) -> Self {
        Self { outcome: Outcome::Success, confidence, reason: reason.into() }
    }

    pub fn failed(confidence: f32, reason: impl Into<String>) -> Self {
        Self { outcome: Outcome::Failed, confidence, reason: reason.into() }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self { outcome: Outcome::Skipped, confidence: 0.0, reason: reason.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub screenshot_before_ref: Option<String>,
    pub screenshot_after_ref: Option<String>,
    pub outcome: Outcome,
    pub judge_confidence: f32,
    pub note: String,
    pub recorded_at_ms: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawOutcome {
    pub performed: bool,
    pub message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub screenshot_before: Screenshot,
    pub screenshot_after: Screenshot,
    pub raw_outcome: RawOutcome,
}

// ========================= Task FSM =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Resolving,
    Planning,
    Grounding,
    AwaitingConfirmation { reason: String },
    Disambiguation { prompt: String, candidates: Vec<String> },
    Executing,
    Judging,
    Completed,
    Failed { report: FailureReport },
    Abandoned { reason: String },
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Resolving => "resolving",
            TaskState::Planning => "planning",
            TaskState::Grounding => "grounding",
            TaskState::AwaitingConfirmation { .. } => "awaiting_confirmation",
            TaskState::Disambiguation { .. } => "disambiguation",
            TaskState::Executing => "executing",
            TaskState::Judging => "judging",
            TaskState::Completed => "completed",
            TaskState::Failed { .. } => "failed",
            TaskState::Abandoned { .. } => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed { .. } | TaskState::Abandoned { .. })
    }

    /// The only states that wait on the user rather than a collaborator.
    pub fn awaits_user(&self) -> bool {
        matches!(self, TaskState::AwaitingConfirmation { .. } | TaskState::Disambiguation { .. })
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskState::Executing | TaskState::Judging)
    }

    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed { .. } | Abandoned { .. }) {
            return true;
        }
        matches!(
            (self, next),
            (Created, Resolving)
                | (Resolving, Planning)
                | (Resolving, Disambiguation { .. })
                | (Disambiguation { .. }, Resolving)
                | (Disambiguation { .. }, Grounding)
                | (Disambiguation { .. }, Planning)
                | (Planning, Planning)
                | (Planning, Grounding)
                | (Planning, Completed)
                | (Grounding, Grounding)
                | (Grounding, Planning)
                | (Grounding, Disambiguation { .. })
                | (Grounding, AwaitingConfirmation { .. })
                | (Grounding, Executing)
                | (AwaitingConfirmation { .. }, Executing)
                | (AwaitingConfirmation { .. }, Grounding)
                | (AwaitingConfirmation { .. }, Planning)
                | (Executing, Judging)
                | (Executing, Planning)
                | (Judging, Planning)
                | (Judging, Completed)
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    pub raw_input: String,
    pub intent: Option<Intent>,
    pub procedure: Option<Procedure>,
    pub step_index: usize,
    pub state: TaskState,
    pub history: Vec<StepRecord>,
    pub replan_count: u32,
    pub consecutive_failures: u32,
    pub steps_attempted: usize,
    /// Feedback drained from the session queue at Planning transitions.
    pub feedback_notes: Vec<String>,
    pub last_failure: Option<AssistError>,
    pub in_flight: Option<Step>,
    pub created_at: u128,
    pub last_activity_at: u128,
}

impl Task {
    pub fn new(session_id: impl Into<SessionId>, raw_input: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: nanoid!(),
            session_id: session_id.into(),
            raw_input: raw_input.into(),
            intent: None,
            procedure: None,
            step_index: 0,
            state: TaskState::Created,
            history: Vec::new(),
            replan_count: 0,
            consecutive_failures: 0,
            steps_attempted: 0,
            feedback_notes: Vec::new(),
            last_failure: None,
            in_flight: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn transition(&mut self, next: TaskState) -> Result<(), AssistError> {
        if !self.state.can_transition_to(&next) {
            return Err(AssistError::Internal(format!(
                "illegal transition {} -> {}",
                self.state.name(),
                next.name()
            )));
        }
        self.state = next;
        self.last_activity_at = now_ms();
        Ok(())
    }

    pub fn procedure_len(&self) -> usize {
        self.procedure.as_ref().map(Procedure::len).unwrap_or(0)
    }

    pub fn remaining_procedure_steps(&self) -> usize {
        self.procedure_len().saturating_sub(self.step_index)
    }

    /// Moves past the current abstract procedure step; never beyond its length.
    pub fn advance(&mut self) {
        if self.step_index < self.procedure_len() {
            self.step_index += 1;
        }
    }

    /// Swaps in a fresh plan; the only place `step_index` moves backwards.
    pub fn install_procedure(&mut self, procedure: Option<Procedure>) {
        self.procedure = procedure;
        self.step_index = 0;
    }

    pub fn record(&mut self, record: StepRecord) {
        self.history.push(record);
        self.last_activity_at = now_ms();
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            session_id: self.session_id.clone(),
            state: self.state.clone(),
            goal: self.intent.as_ref().map(|i| i.goal.clone()),
            step_index: self.step_index,
            procedure_len: self.procedure_len(),
            replan_count: self.replan_count,
            history: self.history.clone(),
            in_flight: self.in_flight.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

/// Read-only view of a task handed across the session boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub state: TaskState,
    pub goal: Option<String>,
    pub step_index: usize,
    pub procedure_len: usize,
    pub replan_count: u32,
    pub history: Vec<StepRecord>,
    pub in_flight: Option<Step>,
    pub created_at: u128,
    pub last_activity_at: u128,
}

impl TaskSnapshot {
    pub fn failure(&self) -> Option<&FailureReport> {
        match &self.state {
            TaskState::Failed { report } => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transitions() {
        let mut task = Task::new("s", "hello");
        task.transition(TaskState::Resolving).unwrap();
        task.transition(TaskState::Abandoned { reason: "closed".into() }).unwrap();
        assert!(task.transition(TaskState::Planning).is_err());
    }

    #[test]
    fn executing_cannot_skip_judging_to_completed() {
        assert!(!TaskState::Executing.can_transition_to(&TaskState::Completed));
        assert!(TaskState::Judging.can_transition_to(&TaskState::Completed));
    }

    #[test]
    fn step_index_is_capped_by_procedure_length() {
        let mut task = Task::new("s", "open chat");
        task.install_procedure(Some(Procedure::new("p", vec![ProcedureStep::new(StepKind::OpenApp, "微信")])));
        task.advance();
        task.advance();
        assert_eq!(task.step_index, 1);
        assert_eq!(task.remaining_procedure_steps(), 0);
    }

    #[test]
    fn coordinate_is_invalid_after_resolution_change() {
        let shot = Screenshot::new(1280, 800, None, None);
        let coord = Coordinate { x: 10, y: 10, source_tier: Tier::Heavy, screen: (1920, 1080) };
        assert!(!coord.is_valid_for(&shot));
    }

    #[test]
    fn bbox_center_is_midpoint() {
        let b = BoundingBox { x1: 100, y1: 200, x2: 140, y2: 260 };
        assert_eq!(b.center(), (120, 230));
        assert!(b.is_well_formed());
    }
}
