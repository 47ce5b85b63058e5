use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(key: &str, fallback: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(fallback)
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: env_or("ASSIST_GROUNDING_RETRIES", 2),
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }
}

#[derive(Clone, Debug)]
pub struct SafetyPolicy {
    pub scam_keywords: Vec<String>,
    /// Two or more words of the same pattern in one text mark it as a likely scam.
    pub scam_patterns: Vec<Vec<String>>,
    pub sensitive_operations: Vec<String>,
    pub credential_markers: Vec<String>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            scam_keywords: words(&[
                "中奖", "客服电话", "公安局", "法院传票", "高额回报", "刷单", "兼职赚钱", "安全账户",
            ]),
            scam_patterns: vec![
                words(&["公安局", "法院", "检察院", "传票", "涉嫌犯罪"]),
                words(&["客服", "退款", "订单异常", "账户冻结"]),
                words(&["高额回报", "稳赚不赔", "内部消息", "投资理财"]),
                words(&["中奖", "领奖", "幸运用户", "免费领取"]),
                words(&["刷单", "兼职", "日赚", "轻松赚钱"]),
                words(&["急用钱", "出事了", "不要告诉"]),
            ],
            sensitive_operations: words(&[
                "支付", "付款", "转账", "汇款", "删除", "注销", "卸载", "授权", "登录", "注册",
                "pay", "payment", "checkout", "transfer", "delete account", "uninstall", "authorize",
            ]),
            credential_markers: words(&[
                "密码", "验证码", "身份证", "银行卡", "支付密码", "cvv", "password", "verification code",
            ]),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FeedbackVocabulary {
    pub cancel: Vec<String>,
    pub confirm: Vec<String>,
}

impl Default for FeedbackVocabulary {
    fn default() -> Self {
        Self {
            cancel: words(&["取消", "不要", "不用", "不用了", "算了", "停", "停下", "别弄了", "cancel", "stop", "no"]),
            confirm: words(&["确认", "确定", "好的", "好", "是", "是的", "对", "可以", "继续", "yes", "ok", "confirm"]),
        }
    }
}

// Any of these makes a reply a question or a refusal, never an approval.
const NOT_APPROVAL: &[char] = &['?', '？', '吗', '不', '没'];
const PARTICLES: &[char] = &['吧', '啊', '呀', '呢', '啦', '哦', '嘛'];

impl FeedbackVocabulary {
    /// The whole reply is cancel words, e.g. "取消" or "不要，算了吧".
    /// Guidance that merely starts with one ("不要点广告，点上面那个") is not.
    pub fn is_cancel(&self, text: &str) -> bool {
        only_words(&self.cancel, text)
    }

    /// An explicit acknowledgment such as "确认" or "好的，继续".
    pub fn is_confirm(&self, text: &str) -> bool {
        !text.contains(NOT_APPROVAL) && !self.is_cancel(text) && only_words(&self.confirm, text)
    }
}

/// Every punctuation-separated part of `text`, trailing particles aside, is in `list`.
fn only_words(list: &[String], text: &str) -> bool {
    let text = text.to_lowercase();
    let mut parts = text.split(|c: char| !c.is_alphanumeric()).filter(|p| !p.is_empty()).peekable();
    if parts.peek().is_none() {
        return false;
    }
    parts.all(|part| {
        let bare = part.trim_end_matches(PARTICLES);
        list.iter().any(|w| {
            let w = w.to_lowercase();
            w == part || w == bare
        })
    })
}

#[derive(Clone, Debug)]
pub struct AssistConfig {
    pub intent_confidence_threshold: f32,
    pub procedure_confidence_threshold: f32,
    pub max_replans: u32,
    pub failures_before_replan: u32,
    pub max_steps: usize,
    pub max_clarifications: u32,
    pub judge_timeout: Duration,
    pub settle_delay: Duration,
    pub collaborator_timeout: Duration,
    pub max_input_chars: usize,
    pub retry: RetryPolicy,
    pub safety: SafetyPolicy,
    pub feedback: FeedbackVocabulary,
}

impl Default for AssistConfig {
    fn default() -> Self {
        Self {
            intent_confidence_threshold: env_or("ASSIST_INTENT_THRESHOLD", 0.5),
            procedure_confidence_threshold: env_or("ASSIST_PROCEDURE_THRESHOLD", 0.6),
            max_replans: env_or("ASSIST_MAX_REPLANS", 3),
            failures_before_replan: 2,
            max_steps: env_or("ASSIST_MAX_STEPS", 20),
            max_clarifications: 2,
            judge_timeout: Duration::from_secs(env_or("ASSIST_JUDGE_TIMEOUT_SECS", 30)),
            settle_delay: Duration::from_millis(env_or("ASSIST_SETTLE_MS", 1500)),
            collaborator_timeout: Duration::from_secs(env_or("ASSIST_COLLABORATOR_TIMEOUT_SECS", 60)),
            max_input_chars: 1000,
            retry: RetryPolicy::default(),
            safety: SafetyPolicy::default(),
            feedback: FeedbackVocabulary::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub api_base: String,
    pub api_key: String,
    pub llm_model: String,
    pub vl_model_light: String,
    pub vl_model_heavy: String,
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("ASSIST_API_BASE").unwrap_or_else(|_| "https://www.sophnet.com/api/open-apis/v1".into()),
            api_key: env::var("ASSIST_API_KEY").unwrap_or_default(),
            llm_model: env::var("ASSIST_LLM_MODEL").unwrap_or_else(|_| "Qwen2.5-72B-Instruct".into()),
            vl_model_light: env::var("ASSIST_VL_LIGHT_MODEL").unwrap_or_else(|_| "Qwen2.5-VL-72B-Instruct".into()),
            vl_model_heavy: env::var("ASSIST_VL_HEAVY_MODEL").unwrap_or_else(|_| "Qwen3-VL-235B-A22B-Instruct".into()),
            temperature: 0.3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChromiumConfig {
    pub headless: bool,
    pub viewport: (u32, u32),
    pub user_agent: Option<String>,
    /// Web apps reachable through `open_app`, keyed by the name the user says.
    pub app_urls: BTreeMap<String, String>,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        let mut app_urls = BTreeMap::new();
        app_urls.insert("微信".to_string(), "https://wx.qq.com".to_string());
        app_urls.insert("百度".to_string(), "https://www.baidu.com".to_string());
        app_urls.insert("新闻".to_string(), "https://news.baidu.com".to_string());
        Self {
            headless: env_or("ASSIST_HEADLESS", false),
            viewport: (1280, 800),
            user_agent: None,
            app_urls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy { max_retries: 2, base_delay: Duration::from_millis(500) };
        assert_eq!(p.delay_for(0), Duration::from_millis(500));
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
    }

    #[test]
    fn cancel_words_win_over_confirm_words() {
        let v = FeedbackVocabulary::default();
        assert!(v.is_cancel("取消"));
        assert!(!v.is_confirm("不要，取消吧"));
        assert!(v.is_confirm("好的，继续"));
        assert!(v.is_confirm("OK"));
        assert!(!v.is_cancel("nothing"));
    }

    #[test]
    fn questions_and_doubts_are_not_approval() {
        let v = FeedbackVocabulary::default();
        assert!(v.is_confirm("确认。"));
        assert!(v.is_confirm(" 可以啊 "));
        assert!(!v.is_confirm("这是什么意思？"));
        assert!(!v.is_confirm("好像不对吧"));
        assert!(!v.is_confirm("是诈骗吗"));
        assert!(!v.is_confirm("是这个"));
        assert!(!v.is_confirm("没问题"));
        assert!(!v.is_confirm(""));
    }

    #[test]
    fn guidance_is_not_a_cancel() {
        let v = FeedbackVocabulary::default();
        assert!(v.is_cancel("算了吧"));
        assert!(v.is_cancel("Stop!"));
        assert!(!v.is_cancel("不要点广告，点上面那个"));
        assert!(!v.is_cancel("停一下再点"));
        assert!(!v.is_cancel("stop clicking ads"));
        assert!(!v.is_cancel("   "));
    }
}
