use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::capabilities::{LanguageModel, ModelPurpose, RawModelOutput, UnderstandRequest};
use crate::config::AssistConfig;
use crate::error::AssistError;
use crate::retry::{bounded, with_backoff};
use crate::types::{GoalPredicate, Intent};

const KINSHIP_TERMS: &[(&str, &str)] = &[
    ("老大", "大儿子/大女儿"),
    ("老二", "二儿子/二女儿"),
    ("老三", "三儿子/三女儿"),
    ("闺女", "女儿"),
    ("老伴", "配偶"),
];

const COLLOQUIAL_TERMS: &[(&str, &str)] = &[
    ("那个绿色的", "微信"),
    ("那个蓝色的", "支付宝或QQ"),
    ("手机吃钱", "流量超标或扣费"),
    ("屏幕上有脏东西关不掉", "悬浮窗广告"),
    ("打字的地方", "输入框"),
    ("小红点", "通知提醒"),
    ("手机发烫", "后台程序过多"),
    ("手机变慢了", "内存不足或缓存过多"),
    ("照片找不到了", "相册或文件管理"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TechLevel {
    Novice,
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

/// What the assistant knows about the person it is helping.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SessionProfile {
    pub name: String,
    pub age: Option<u32>,
    pub tech_level: TechLevel,
    /// Personal references to real names or terms, e.g. "老二" -> "张伟".
    pub entity_aliases: BTreeMap<String, String>,
    pub frequent_apps: Vec<String>,
    pub interests: Vec<String>,
}

impl SessionProfile {
    pub fn with_alias(mut self, nickname: impl Into<String>, real: impl Into<String>) -> Self {
        self.entity_aliases.insert(nickname.into(), real.into());
        self
    }

    /// Profile aliases first, then common kinship terms, then colloquial phrases.
    pub fn resolve_reference(&self, term: &str) -> Option<String> {
        let term = term.trim();
        if let Some(v) = self.entity_aliases.get(term) {
            return Some(v.clone());
        }
        KINSHIP_TERMS
            .iter()
            .chain(COLLOQUIAL_TERMS)
            .find(|(k, _)| *k == term)
            .map(|(_, v)| v.to_string())
    }

    /// Every known mapping, rendered for the inference prompt.
    pub fn entity_mapping(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .entity_aliases
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in KINSHIP_TERMS.iter().chain(COLLOQUIAL_TERMS) {
            if !self.entity_aliases.contains_key(*k) {
                out.push((k.to_string(), v.to_string()));
            }
        }
        out
    }

    pub fn to_context_string(&self) -> String {
        let mut parts = Vec::new();
        if !self.name.is_empty() {
            parts.push(format!("User: {}", self.name));
        }
        if let Some(age) = self.age {
            parts.push(format!("Age: {}", age));
        }
        let level = match self.tech_level {
            TechLevel::Novice => "has never used a computer alone",
            TechLevel::Beginner => "knows basic operations but forgets them",
            TechLevel::Intermediate => "handles simple tasks alone",
            TechLevel::Advanced => "fairly confident, occasionally needs help",
        };
        parts.push(format!("Experience: {}", level));
        if !self.frequent_apps.is_empty() {
            parts.push(format!("Frequent apps: {}", self.frequent_apps.join(", ")));
        }
        if !self.interests.is_empty() {
            parts.push(format!("Interests: {}", self.interests.join(", ")));
        }
        parts.join("\n")
    }
}

/// Trims, bounds and strips markup characters from a raw utterance.
pub fn sanitize_input(text: &str, max_chars: usize) -> Result<String, AssistError> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '&' | '"' | '\'' | '\\' | '\0'))
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        return Err(AssistError::InvalidInput("empty utterance".into()));
    }
    let len = cleaned.chars().count();
    if len > max_chars {
        return Err(AssistError::InvalidInput(format!("utterance too long: {} > {}", len, max_chars)));
    }
    Ok(cleaned)
}

#[derive(Debug, Deserialize)]
struct IntentPayload {
    goal: String,
    #[serde(default)]
    entities: BTreeMap<String, String>,
    confidence: f32,
    #[serde(default)]
    target_app: Option<String>,
    #[serde(default)]
    target_state: Option<String>,
    #[serde(default)]
    success_criteria: Vec<String>,
}

pub struct IntentResolver {
    llm: Arc<dyn LanguageModel>,
    cfg: AssistConfig,
}

impl IntentResolver {
    pub fn new(llm: Arc<dyn LanguageModel>, cfg: AssistConfig) -> Self {
        Self { llm, cfg }
    }

    pub async fn resolve(&self, raw_text: &str, profile: &SessionProfile) -> Result<Intent, AssistError> {
        let text = sanitize_input(raw_text, self.cfg.max_input_chars)?;

        let restated = self
            .ask(ModelPurpose::PerspectiveTaking, Self::perspective_prompt(&text, profile), profile, |out| {
                let restated = out.text.trim();
                if restated.is_empty() {
                    return Err(AssistError::CollaboratorUnavailable("empty perspective-taking output".into()));
                }
                Ok(restated.to_string())
            })
            .await?;
        debug!(restated = %restated, "perspective-taking pass");

        let payload: IntentPayload = self
            .ask(ModelPurpose::IntentInference, Self::inference_prompt(&text, &restated, profile), profile, |out| {
                out.parse_json()
            })
            .await?;
        let intent = self.build_intent(text, restated, payload, profile)?;
        info!(goal = %intent.goal, confidence = intent.confidence, ambiguous = intent.ambiguous, "intent resolved");
        Ok(intent)
    }

    /// One model call; output that fails `accept` is retried like an unavailable collaborator.
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

    fn build_intent(
        &self,
        raw_text: String,
        restated: String,
        payload: IntentPayload,
        profile: &SessionProfile,
    ) -> Result<Intent, AssistError> {
        let goal = payload.goal.trim().to_string();
        if goal.is_empty() {
            return Err(AssistError::CollaboratorUnavailable("intent without goal".into()));
        }
        if !payload.confidence.is_finite() || !(0.0..=1.0).contains(&payload.confidence) {
            return Err(AssistError::CollaboratorUnavailable(format!(
                "intent confidence out of range: {}",
                payload.confidence
            )));
        }
        let entities: BTreeMap<String, String> = payload
            .entities
            .into_iter()
            .map(|(k, v)| {
                let resolved = profile.resolve_reference(&v).unwrap_or(v);
                (k, resolved)
            })
            .collect();
        let target_app = payload
            .target_app
            .filter(|s| !s.trim().is_empty())
            .map(|a| profile.resolve_reference(&a).unwrap_or(a))
            .or_else(|| entities.get("app").cloned());
        Ok(Intent {
            raw_text,
            normalized_text: restated,
            goal,
            entities,
            confidence: payload.confidence,
            ambiguous: payload.confidence < self.cfg.intent_confidence_threshold,
            predicate: GoalPredicate {
                target_app,
                target_state: payload.target_state.filter(|s| !s.trim().is_empty()),
                success_criteria: payload.success_criteria,
            },
        })
    }

    fn perspective_prompt(text: &str, profile: &SessionProfile) -> String {
        format!(
            "Someone who is not familiar with computers said: \"{text}\"\n\
             About them:\n{ctx}\n\n\
             Restate, in their own language and from their point of view, what they believe is \
             happening and what they want. Do not name any specific computer operation yet. \
             Reply with one or two plain sentences.",
            text = text,
            ctx = profile.to_context_string(),
        )
    }

    fn inference_prompt(text: &str, restated: &str, profile: &SessionProfile) -> String {
        let mapping = profile
            .entity_mapping()
            .into_iter()
            .map(|(k, v)| format!("- \"{}\" means \"{}\"", k, v))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Original words: \"{text}\"\nWhat they mean: {restated}\n\
             Known references:\n{mapping}\n\n\
             Return only JSON:\n\
             {{\"goal\": \"short snake_case goal such as open_app, send_message, video_call\", \
             \"entities\": {{\"app\": \"...\", \"contact\": \"...\"}}, \
             \"confidence\": 0.0-1.0, \
             \"target_app\": \"app that should be in front when done, or null\", \
             \"target_state\": \"what the screen shows when done, or null\", \
             \"success_criteria\": [\"text visible when done\"]}}",
            text = text,
            restated = restated,
            mapping = mapping,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<RawModelOutput, AssistError>>>,
        seen: Mutex<Vec<ModelPurpose>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<&str, AssistError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().rev().map(|r| r.map(RawModelOutput::new)).collect()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        async fn understand(&self, request: &UnderstandRequest) -> Result<RawModelOutput, AssistError> {
            self.seen.lock().unwrap().push(request.purpose);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(AssistError::CollaboratorUnavailable("script exhausted".into())))
        }
    }

    fn cfg() -> AssistConfig {
        let mut cfg = AssistConfig::default();
        cfg.intent_confidence_threshold = 0.5;
        cfg.retry.base_delay = std::time::Duration::from_millis(1);
        cfg
    }

    #[tokio::test]
    async fn two_passes_produce_an_intent_with_resolved_entities() {
        let llm = Arc::new(Scripted::new(vec![
            Ok("我想和二儿子说说话"),
            Ok(concat!(
                r#"{"goal":"video_call","entities":{"contact":"老二","app":"那个绿色的"},"#,
                r#""confidence":0.85,"target_app":"那个绿色的"}"#
            )),
        ]));
        let resolver = IntentResolver::new(llm.clone(), cfg());
        let profile = SessionProfile::default().with_alias("老二", "张伟");
        let intent = resolver.resolve("帮我找老二视频", &profile).await.unwrap();

        assert_eq!(intent.goal, "video_call");
        assert_eq!(intent.entities["contact"], "张伟");
        assert_eq!(intent.entities["app"], "微信");
        assert_eq!(intent.predicate.target_app.as_deref(), Some("微信"));
        assert!(!intent.ambiguous);
        assert_eq!(
            *llm.seen.lock().unwrap(),
            vec![ModelPurpose::PerspectiveTaking, ModelPurpose::IntentInference]
        );
    }

    #[tokio::test]
    async fn low_confidence_marks_intent_ambiguous() {
        let llm = Arc::new(Scripted::new(vec![
            Ok("不太清楚想做什么"),
            Ok(r#"{"goal":"help","confidence":0.3}"#),
        ]));
        let resolver = IntentResolver::new(llm, cfg());
        let intent = resolver.resolve("那个东西", &SessionProfile::default()).await.unwrap();
        assert!(intent.ambiguous);
    }

    #[tokio::test]
    async fn transient_failure_in_a_pass_is_retried() {
        let llm = Arc::new(Scripted::new(vec![
            Err(AssistError::CollaboratorUnavailable("502".into())),
            Ok("打开微信"),
            Ok(r#"{"goal":"open_app","entities":{"app":"微信"},"confidence":0.9}"#),
        ]));
        let resolver = IntentResolver::new(llm, cfg());
        let intent = resolver.resolve("帮我打开微信", &SessionProfile::default()).await.unwrap();
        assert_eq!(intent.predicate.target_app.as_deref(), Some("微信"));
    }

    #[tokio::test]
    async fn malformed_inference_output_is_asked_again() {
        let llm = Arc::new(Scripted::new(vec![
            Ok("打开微信"),
            Ok("I think they want WeChat"),
            Ok(r#"{"goal":"open_app","entities":{"app":"微信"},"confidence":0.9}"#),
        ]));
        let resolver = IntentResolver::new(llm.clone(), cfg());
        let intent = resolver.resolve("帮我打开微信", &SessionProfile::default()).await.unwrap();
        assert_eq!(intent.goal, "open_app");
        assert_eq!(
            *llm.seen.lock().unwrap(),
            vec![ModelPurpose::PerspectiveTaking, ModelPurpose::IntentInference, ModelPurpose::IntentInference]
        );
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_rejected() {
        let llm = Arc::new(Scripted::new(vec![Ok("x"), Ok(r#"{"goal":"open_app","confidence":7}"#)]));
        let mut c = cfg();
        c.retry.max_retries = 0;
        let resolver = IntentResolver::new(llm, c);
        let err = resolver.resolve("打开", &SessionProfile::default()).await.unwrap_err();
        assert!(matches!(err, AssistError::CollaboratorUnavailable(_)));
    }

    #[test]
    fn sanitize_strips_markup_and_rejects_empty() {
        assert_eq!(sanitize_input("  <b>打开微信</b> ", 100).unwrap(), "b打开微信/b");
        assert!(sanitize_input("   ", 100).is_err());
        assert!(sanitize_input("abcdef", 3).is_err());
    }
}
