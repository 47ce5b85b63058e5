#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use steady_hands::capabilities::{
    ElementLocator, InputAction, InputDevice, LanguageModel, ModelPurpose, Notifier, RawModelOutput,
    ScreenCapture, ScreenClassifier, UnderstandRequest,
};
use steady_hands::types::{BoundingBox, ScreenClassification, Screenshot, Severity, WindowInfo};
use steady_hands::{
    AssistConfig, AssistError, Collaborators, Orchestrator, Procedure, SessionRegistry, StaticKnowledgeBase,
};

// ========================= Fake desktop =========================

/// What the fake screen shows: one classification plus the resolution.
#[derive(Clone, Debug)]
pub struct View {
    pub screen: ScreenClassification,
    pub resolution: (u32, u32),
}

impl View {
    pub fn new(app: &str, page: &str, elements: &[&str]) -> Self {
        Self {
            screen: ScreenClassification {
                app: app.into(),
                page_state: page.into(),
                elements: elements.iter().map(|s| s.to_string()).collect(),
                is_desktop: app == "桌面",
                ..Default::default()
            },
            resolution: (1280, 800),
        }
    }

    pub fn desktop() -> Self {
        Self::new("桌面", "desktop", &["微信", "浏览器", "回收站"])
    }

    pub fn wechat() -> Self {
        Self::new("微信", "chat list", &["搜索", "通讯录", "视频通话"])
    }
}

/// Element `i` occupies a 100x30 box at y = 10 + 40 * i.
pub fn element_box(i: usize) -> BoundingBox {
    let y = 10 + 40 * i as i64;
    BoundingBox { x1: 10, y1: y, x2: 110, y2: y + 30 }
}

/// Screen, vision tiers and input device over one shared view.
/// Input reactions change the view the way a real app would.
pub struct FakeDesktop {
    view: Mutex<View>,
    apps: Mutex<Vec<(String, View)>>,
    clicks: Mutex<Vec<(String, View)>>,
    pub actions: Mutex<Vec<InputAction>>,
    pub locate_calls: Mutex<Vec<String>>,
}

impl FakeDesktop {
    pub fn new(view: View) -> Arc<Self> {
        Arc::new(Self {
            view: Mutex::new(view),
            apps: Mutex::new(Vec::new()),
            clicks: Mutex::new(Vec::new()),
            actions: Mutex::new(Vec::new()),
            locate_calls: Mutex::new(Vec::new()),
        })
    }

    /// `open_app(name)` switches to `view`.
    pub fn app(self: &Arc<Self>, name: &str, view: View) -> Arc<Self> {
        self.apps.lock().unwrap().push((name.into(), view));
        self.clone()
    }

    /// Clicking `element` switches to `view`.
    pub fn on_click(self: &Arc<Self>, element: &str, view: View) -> Arc<Self> {
        self.clicks.lock().unwrap().push((element.into(), view));
        self.clone()
    }

    /// Changes the screen outside the assistant's control.
    pub fn show(&self, view: View) {
        *self.view.lock().unwrap() = view;
    }

    pub fn current(&self) -> View {
        self.view.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<InputAction> {
        self.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScreenCapture for FakeDesktop {
    async fn capture(&self) -> Result<Screenshot, AssistError> {
        let view = self.current();
        let window = WindowInfo { app: view.screen.app.clone(), title: None };
        Ok(Screenshot::new(view.resolution.0, view.resolution.1, None, Some(window)))
    }
}

#[async_trait]
impl ScreenClassifier for FakeDesktop {
    async fn classify_screen(&self, _shot: &Screenshot) -> Result<ScreenClassification, AssistError> {
        Ok(self.current().screen)
    }
}

#[async_trait]
impl ElementLocator for FakeDesktop {
    async fn locate_element(&self, _shot: &Screenshot, description: &str) -> Result<BoundingBox, AssistError> {
        self.locate_calls.lock().unwrap().push(description.into());
        let view = self.current();
        view.screen
            .elements
            .iter()
            .position(|e| e == description)
            .map(element_box)
            .ok_or_else(|| AssistError::GroundingNotFound(description.into()))
    }
}

#[async_trait]
impl InputDevice for FakeDesktop {
    async fn perform(&self, action: &InputAction) -> Result<(), AssistError> {
        self.actions.lock().unwrap().push(action.clone());
        let next = match action {
            InputAction::OpenApp { name } => {
                self.apps.lock().unwrap().iter().find(|(n, _)| n == name).map(|(_, v)| v.clone())
            }
            InputAction::Click { y, .. } => {
                let view = self.current();
                let index = ((*y - 10) / 40).max(0) as usize;
                view.screen.elements.get(index).and_then(|element| {
                    self.clicks.lock().unwrap().iter().find(|(e, _)| e == element).map(|(_, v)| v.clone())
                })
            }
            _ => None,
        };
        if let Some(v) = next {
            self.show(v);
        }
        Ok(())
    }
}

// ========================= Scripted model =========================

/// Answers by rule: the first rule whose purpose matches and whose needle
/// appears in the prompt wins. Rules are sticky, so repeated calls repeat.
#[derive(Default)]
pub struct ScriptedLlm {
    rules: Mutex<Vec<(ModelPurpose, Option<String>, String)>>,
    pub calls: Mutex<Vec<ModelPurpose>>,
    prompts: Mutex<Vec<(ModelPurpose, String)>>,
}

impl ScriptedLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(self: &Arc<Self>, purpose: ModelPurpose, text: &str) -> Arc<Self> {
        self.rules.lock().unwrap().push((purpose, None, text.into()));
        self.clone()
    }

    pub fn reply_when(self: &Arc<Self>, purpose: ModelPurpose, needle: &str, text: &str) -> Arc<Self> {
        self.rules.lock().unwrap().push((purpose, Some(needle.into()), text.into()));
        self.clone()
    }

    /// Both intent passes for a confident request.
    pub fn intent(self: &Arc<Self>, restated: &str, json: &str) -> Arc<Self> {
        self.reply(ModelPurpose::PerspectiveTaking, restated).reply(ModelPurpose::IntentInference, json)
    }

    pub fn count(&self, purpose: ModelPurpose) -> usize {
        self.calls.lock().unwrap().iter().filter(|p| **p == purpose).count()
    }

    pub fn prompts(&self, purpose: ModelPurpose) -> Vec<String> {
        self.prompts.lock().unwrap().iter().filter(|(p, _)| *p == purpose).map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn understand(&self, request: &UnderstandRequest) -> Result<RawModelOutput, AssistError> {
        self.calls.lock().unwrap().push(request.purpose);
        self.prompts.lock().unwrap().push((request.purpose, request.text.clone()));
        let rules = self.rules.lock().unwrap();
        rules
            .iter()
            .find(|(p, needle, _)| *p == request.purpose && needle.as_ref().map_or(true, |n| request.text.contains(n)))
            .map(|(_, _, text)| RawModelOutput::new(text.clone()))
            .ok_or_else(|| AssistError::Internal(format!("no scripted reply for {:?}", request.purpose)))
    }
}

// ========================= Notifier =========================

#[derive(Default)]
pub struct RecordingNotifier(pub Mutex<Vec<(String, Severity)>>);

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn saw(&self, fragment: &str) -> bool {
        self.messages().iter().any(|m| m.contains(fragment))
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_user(&self, message: &str, severity: Severity) {
        self.0.lock().unwrap().push((message.to_string(), severity));
    }
}

// ========================= Harness =========================

pub fn test_config() -> AssistConfig {
    let mut cfg = AssistConfig::default();
    cfg.intent_confidence_threshold = 0.5;
    cfg.procedure_confidence_threshold = 0.6;
    cfg.max_replans = 3;
    cfg.max_steps = 20;
    cfg.judge_timeout = Duration::from_secs(30);
    cfg.settle_delay = Duration::from_millis(1500);
    cfg.retry.max_retries = 1;
    cfg.retry.base_delay = Duration::from_millis(10);
    cfg
}

pub struct Harness {
    pub desktop: Arc<FakeDesktop>,
    pub llm: Arc<ScriptedLlm>,
    pub notifier: Arc<RecordingNotifier>,
    pub registry: SessionRegistry,
}

pub fn harness(
    desktop: Arc<FakeDesktop>,
    llm: Arc<ScriptedLlm>,
    procedures: Vec<Procedure>,
    cfg: AssistConfig,
) -> Harness {
    let notifier = Arc::new(RecordingNotifier::default());
    let collab = Collaborators::new(
        llm.clone(),
        desktop.clone(),
        desktop.clone(),
        Arc::new(StaticKnowledgeBase::new(procedures)),
        desktop.clone(),
        desktop.clone(),
    )
    .with_notifier(notifier.clone());
    let orchestrator = Arc::new(Orchestrator::new(collab, cfg));
    Harness { desktop, llm, notifier, registry: SessionRegistry::new(orchestrator) }
}
