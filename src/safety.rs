use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::SafetyPolicy;
use crate::types::{Intent, Step, StepKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Medium,
    High,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TextAssessment {
    pub risk: Option<RiskLevel>,
    pub warnings: Vec<String>,
}

impl TextAssessment {
    pub fn level(&self) -> RiskLevel {
        self.risk.unwrap_or(RiskLevel::Safe)
    }

    fn raise(&mut self, level: RiskLevel, warning: String) {
        self.risk = Some(self.level().max(level));
        self.warnings.push(warning);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum SafetyDecision {
    Allow,
    Block(String),
    RequireConfirmation(String),
}

impl SafetyDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, SafetyDecision::Allow)
    }
}

/// Screens steps before the executor runs and content before it reaches the user.
pub struct SafetyGate {
    policy: SafetyPolicy,
}

impl SafetyGate {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self { policy }
    }

    pub fn assess_text(&self, text: &str) -> TextAssessment {
        let mut out = TextAssessment::default();
        if text.trim().is_empty() {
            return out;
        }
        let lower = text.to_lowercase();
        for kw in &self.policy.scam_keywords {
            if lower.contains(&kw.to_lowercase()) {
                out.raise(RiskLevel::Medium, format!("suspicious wording: {}", kw));
            }
        }
        for pattern in &self.policy.scam_patterns {
            let hits = pattern.iter().filter(|w| lower.contains(&w.to_lowercase())).count();
            if hits >= 2 {
                out.raise(RiskLevel::High, format!("matches a known scam pattern ({})", pattern.join("/")));
                break;
            }
        }
        for marker in &self.policy.credential_markers {
            if lower.contains(&marker.to_lowercase()) {
                out.raise(RiskLevel::Medium, format!("asks for private information: {}", marker));
            }
        }
        out
    }

    /// Screens retrieved or displayed content. Likely scams are blocked outright.
    pub fn check_content(&self, text: &str) -> SafetyDecision {
        let a = self.assess_text(text);
        match a.level() {
            RiskLevel::High => SafetyDecision::Block(first_warning(&a)),
            RiskLevel::Medium => SafetyDecision::RequireConfirmation(first_warning(&a)),
            RiskLevel::Safe => SafetyDecision::Allow,
        }
    }

    pub fn check(&self, step: &Step, intent: Option<&Intent>) -> SafetyDecision {
        let mut step_text = step.target_description.clone();
        if let Some(input) = &step.input {
            step_text.push(' ');
            step_text.push_str(input);
        }
        let step_risk = self.assess_text(&step_text);
        let context_risk = intent
            .map(|i| self.assess_text(&format!("{} {}", i.raw_text, i.normalized_text)))
            .unwrap_or_default();

        let decision = if step_risk.level() == RiskLevel::High {
            SafetyDecision::Block(first_warning(&step_risk))
        } else if context_risk.level() == RiskLevel::High && self.is_sensitive(&step_text) {
            SafetyDecision::Block(format!(
                "{} while the request {}",
                step.friendly_description(),
                first_warning(&context_risk)
            ))
        } else if self.is_sensitive(&step_text) {
            SafetyDecision::RequireConfirmation(format!("{} is a sensitive operation", step.friendly_description()))
        } else if step.kind == StepKind::Type && self.mentions_credentials(&step_text) {
            SafetyDecision::RequireConfirmation("this step enters private information".into())
        } else if step_risk.level() == RiskLevel::Medium {
            SafetyDecision::RequireConfirmation(first_warning(&step_risk))
        } else {
            SafetyDecision::Allow
        };
        if !decision.is_allow() {
            warn!(step = %step.friendly_description(), decision = ?decision, "safety gate intervened");
        }
        decision
    }

    fn is_sensitive(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.policy.sensitive_operations.iter().any(|op| lower.contains(&op.to_lowercase()))
    }

    fn mentions_credentials(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.policy.credential_markers.iter().any(|m| lower.contains(&m.to_lowercase()))
    }
}

fn first_warning(a: &TextAssessment) -> String {
    a.warnings.first().cloned().unwrap_or_else(|| "looks unsafe".to_string())
}

/// Gentle wording for the user; never suggests they did something wrong.
pub fn user_message(decision: &SafetyDecision) -> Option<String> {
    match decision {
        SafetyDecision::Allow => None,
        SafetyDecision::Block(reason) => Some(format!(
            "The assistant paused here to keep your accounts safe ({}). A family member or 110 can help check it.",
            reason
        )),
        SafetyDecision::RequireConfirmation(reason) => Some(format!(
            "Before going on: {}. Say \"确认\" to continue or \"取消\" to stop.",
            reason
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GoalPredicate;
    use std::collections::BTreeMap;

    fn gate() -> SafetyGate {
        SafetyGate::new(SafetyPolicy::default())
    }

    #[test]
    fn payment_steps_need_confirmation() {
        let step = Step::new(StepKind::Click, "确认支付");
        assert!(matches!(gate().check(&step, None), SafetyDecision::RequireConfirmation(_)));
    }

    #[test]
    fn typing_a_verification_code_needs_confirmation() {
        let step = Step::new(StepKind::Type, "验证码输入框").with_input("123456");
        assert!(matches!(gate().check(&step, None), SafetyDecision::RequireConfirmation(_)));
    }

    #[test]
    fn scam_pattern_in_content_is_blocked() {
        let d = gate().check_content("您的订单异常，请联系客服办理退款");
        assert!(matches!(d, SafetyDecision::Block(_)));
        assert_eq!(gate().check_content("打开微信，点击通讯录"), SafetyDecision::Allow);
    }

    #[test]
    fn transfer_requested_under_scam_pressure_is_blocked() {
        let intent = Intent {
            raw_text: "公安局说我涉嫌犯罪，要我转账到安全账户".into(),
            normalized_text: String::new(),
            goal: "transfer".into(),
            entities: BTreeMap::new(),
            confidence: 0.9,
            ambiguous: false,
            predicate: GoalPredicate::default(),
        };
        let step = Step::new(StepKind::Click, "转账");
        assert!(matches!(gate().check(&step, Some(&intent)), SafetyDecision::Block(_)));
    }

    #[test]
    fn ordinary_steps_are_allowed() {
        assert!(gate().check(&Step::new(StepKind::OpenApp, "微信"), None).is_allow());
        assert!(user_message(&SafetyDecision::Allow).is_none());
    }
}
