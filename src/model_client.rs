use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::capabilities::{
    ElementLocator, LanguageModel, ModelPurpose, RawModelOutput, ScreenClassifier, UnderstandRequest,
};
use crate::config::ModelConfig;
use crate::error::AssistError;
use crate::types::{BoundingBox, PageStatus, ScreenClassification, Screenshot};

/// OpenAI-compatible `/chat/completions` client for the language and vision collaborators.
#[derive(Clone)]
pub struct ModelClient {
    http: Client,
    cfg: ModelConfig,
}

#[derive(Debug, Deserialize)]
struct ClassificationPayload {
    #[serde(default)]
    app_name: String,
    #[serde(default)]
    screen_state: String,
    #[serde(default)]
    page_status: Option<String>,
    #[serde(default)]
    is_desktop: bool,
    #[serde(default)]
    available_elements: Vec<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocatePayload {
    #[serde(default = "default_found")]
    found: bool,
    #[serde(default)]
    bbox_2d: Vec<i64>,
}

fn default_found() -> bool {
    true
}

fn unavailable(e: anyhow::Error) -> AssistError {
    AssistError::CollaboratorUnavailable(format!("{:#}", e))
}

fn page_status(s: Option<&str>) -> PageStatus {
    match s.map(|s| s.trim().to_lowercase()).as_deref() {
        Some("normal") | None => PageStatus::Normal,
        Some("loading") => PageStatus::Loading,
        Some("error") => PageStatus::Error,
        Some("dialog") => PageStatus::Dialog,
        Some("login") => PageStatus::Login,
        Some(_) => PageStatus::Unknown,
    }
}

impl ModelClient {
    pub fn new(cfg: ModelConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("ASSIST_API_KEY missing");
        }
        Ok(Self { http: Client::new(), cfg })
    }

    async fn chat(&self, model: &str, messages: Value, max_tokens: u32) -> Result<String> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));
        let req = json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": self.cfg.temperature,
        });
        let resp = self.http.post(url).bearer_auth(&self.cfg.api_key).json(&req).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("model API error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse model response JSON")?;
        let content = v
            .pointer("/choices/0/message/content")
            .and_then(|x| x.as_str())
            .context("response has no message content")?;
        debug!(model, chars = content.len(), "model replied");
        Ok(content.to_string())
    }

    fn image_message(shot: &Screenshot, prompt: &str) -> Result<Value, AssistError> {
        let b64 = shot
            .image_base64
            .as_deref()
            .ok_or_else(|| AssistError::CollaboratorUnavailable("screenshot carries no pixels".into()))?;
        Ok(json!([{
            "role": "user",
            "content": [
                { "type": "image_url", "image_url": { "url": format!("data:image/png;base64,{}", b64) } },
                { "type": "text", "text": prompt }
            ]
        }]))
    }

    fn system_prompt(purpose: ModelPurpose) -> &'static str {
        match purpose {
            ModelPurpose::PerspectiveTaking => {
                "You help elderly people who are new to computers. Listen for what they mean, not the words they use."
            }
            ModelPurpose::IntentInference => "You turn requests into structured intents. Reply with JSON only.",
            ModelPurpose::StepSynthesis => {
                "You operate a computer one atomic step at a time: observe, think, act. Reply with JSON only."
            }
            ModelPurpose::Replan => "You plan short sequences of atomic computer operations. Reply with JSON only.",
        }
    }
}

#[async_trait]
impl LanguageModel for ModelClient {
    async fn understand(&self, request: &UnderstandRequest) -> Result<RawModelOutput, AssistError> {
        let mut system = Self::system_prompt(request.purpose).to_string();
        let profile = request.profile.to_context_string();
        if !profile.is_empty() {
            system.push_str("\n\n");
            system.push_str(&profile);
        }
        let messages = json!([
            { "role": "system", "content": system },
            { "role": "user", "content": request.text }
        ]);
        let text = self.chat(&self.cfg.llm_model, messages, 1000).await.map_err(unavailable)?;
        Ok(RawModelOutput::new(text))
    }
}

#[async_trait]
impl ScreenClassifier for ModelClient {
    async fn classify_screen(&self, shot: &Screenshot) -> Result<ScreenClassification, AssistError> {
        let prompt = "Describe this screenshot. Do not give coordinates. Return only JSON:\n\
            {\"app_name\": \"application in front, or 'desktop'\", \
            \"screen_state\": \"short page description such as chat list, login page\", \
            \"page_status\": \"normal|loading|error|dialog|login\", \
            \"is_desktop\": false, \
            \"available_elements\": [\"names of clickable or typeable elements\"], \
            \"description\": \"visible text worth noting\"}";
        let messages = Self::image_message(shot, prompt)?;
        let text = self.chat(&self.cfg.vl_model_light, messages, 1500).await.map_err(unavailable)?;
        let p: ClassificationPayload = RawModelOutput::new(text).parse_json()?;
        if p.app_name.trim().is_empty() && p.available_elements.is_empty() {
            return Err(AssistError::CollaboratorUnavailable("empty screen classification".into()));
        }
        Ok(ScreenClassification {
            app: p.app_name,
            page_state: p.screen_state,
            page_status: page_status(p.page_status.as_deref()),
            elements: p.available_elements,
            text: p.description,
            is_desktop: p.is_desktop,
        })
    }
}

#[async_trait]
impl ElementLocator for ModelClient {
    async fn locate_element(&self, shot: &Screenshot, description: &str) -> Result<BoundingBox, AssistError> {
        let prompt = format!(
            "Find \"{}\" in this {}x{} screenshot. Return only JSON: \
             {{\"found\": true, \"bbox_2d\": [x1, y1, x2, y2]}} with pixel coordinates of the \
             top-left and bottom-right corners, or {{\"found\": false}}.",
            description, shot.width, shot.height
        );
        let messages = Self::image_message(shot, &prompt)?;
        let text = self.chat(&self.cfg.vl_model_heavy, messages, 300).await.map_err(unavailable)?;
        let p: LocatePayload = RawModelOutput::new(text).parse_json()?;
        if !p.found {
            return Err(AssistError::GroundingNotFound(description.to_string()));
        }
        match p.bbox_2d.as_slice() {
            [x1, y1, x2, y2] => Ok(BoundingBox { x1: *x1, y1: *y1, x2: *x2, y2: *y2 }),
            other => Err(AssistError::CollaboratorUnavailable(format!(
                "bbox must have 4 numbers, got {}",
                other.len()
            ))),
        }
    }
}
