//! Narrow capability interfaces to everything outside the control loop.
//!
//! Collaborators answer with loosely shaped model output; everything that
//! crosses this boundary is parsed into a typed response here, and anything
//! malformed is reported as [`AssistError::CollaboratorUnavailable`].

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::AssistError;
use crate::intent::SessionProfile;
use crate::types::{
    BoundingBox, InputEvent, Intent, ScoredProcedure, ScreenClassification, Screenshot, Severity,
};

// ========================= Requests & responses =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPurpose {
    /// Pass 1: restate the utterance as the speaker means it.
    PerspectiveTaking,
    /// Pass 2: structured intent from the restatement.
    IntentInference,
    /// ReAct step synthesis when no procedure step fits.
    StepSynthesis,
    /// Fresh multi-step plan after a failure.
    Replan,
}

#[derive(Clone, Debug)]
pub struct UnderstandRequest {
    pub purpose: ModelPurpose,
    pub text: String,
    pub profile: SessionProfile,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawModelOutput {
    pub text: String,
}

impl RawModelOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Parses the first JSON object embedded in the output.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, AssistError> {
        let json = extract_json(&self.text)
            .ok_or_else(|| AssistError::CollaboratorUnavailable("model output contained no JSON object".into()))?;
        serde_json::from_str(json)
            .map_err(|e| AssistError::CollaboratorUnavailable(format!("malformed model output: {}", e)))
    }
}

/// Returns the outermost `{...}` span, tolerating prose and code fences around it.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Concrete input events the executor can issue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputAction {
    Click { x: i64, y: i64 },
    Type { text: String },
    Key { combo: String },
    OpenApp { name: String },
    /// Nothing to issue; the step only observes.
    None,
}

// ========================= Capability traits =========================

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn understand(&self, request: &UnderstandRequest) -> Result<RawModelOutput, AssistError>;
}

#[async_trait]
pub trait ScreenClassifier: Send + Sync {
    async fn classify_screen(&self, shot: &Screenshot) -> Result<ScreenClassification, AssistError>;
}

#[async_trait]
pub trait ElementLocator: Send + Sync {
    async fn locate_element(&self, shot: &Screenshot, description: &str) -> Result<BoundingBox, AssistError>;
}

#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn retrieve_procedures(&self, intent: &Intent) -> Result<Vec<ScoredProcedure>, AssistError>;
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<Screenshot, AssistError>;
}

#[async_trait]
pub trait InputDevice: Send + Sync {
    async fn perform(&self, action: &InputAction) -> Result<(), AssistError>;
}

/// Source of physical user input (mouse/keyboard hooks).
///
/// Each call yields a fresh subscription; dropping the stream unsubscribes.
pub trait InputMonitor: Send + Sync {
    fn subscribe(&self) -> BoxStream<'static, InputEvent>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user(&self, message: &str, severity: Severity);
}

// ========================= Defaults & helpers =========================

pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify_user(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => info!(target: "steady_hands::notify", "{}", message),
            Severity::Warning | Severity::Critical => {
                warn!(target: "steady_hands::notify", severity = ?severity, "{}", message)
            }
        }
    }
}

/// Monitor that never reports input; judges fall through to their timeout path.
#[derive(Clone, Copy)]
pub struct SilentInputMonitor;

impl InputMonitor for SilentInputMonitor {
    fn subscribe(&self) -> BoxStream<'static, InputEvent> {
        stream::pending().boxed()
    }
}

/// Fan-out monitor fed by whatever installs the OS hooks.
#[derive(Clone)]
pub struct BroadcastInputMonitor {
    tx: broadcast::Sender<InputEvent>,
}

impl BroadcastInputMonitor {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to every live subscription; dropped when nobody listens.
    pub fn publish(&self, event: InputEvent) {
        let _ = self.tx.send(event);
    }
}

impl InputMonitor for BroadcastInputMonitor {
    fn subscribe(&self) -> BoxStream<'static, InputEvent> {
        let rx = self.tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => return Some((ev, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
