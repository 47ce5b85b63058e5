use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::capabilities::KnowledgeRetriever;
use crate::error::AssistError;
use crate::types::{Intent, Procedure, ScoredProcedure};

/// In-process procedure library scored by keyword overlap with the intent.
#[derive(Default)]
pub struct StaticKnowledgeBase {
    procedures: RwLock<Vec<Procedure>>,
}

impl StaticKnowledgeBase {
    pub fn new(procedures: Vec<Procedure>) -> Self {
        Self { procedures: RwLock::new(procedures) }
    }

    pub async fn add(&self, procedure: Procedure) {
        self.procedures.write().await.push(procedure);
    }

    fn score(procedure: &Procedure, intent: &Intent) -> f32 {
        if procedure.keywords.is_empty() {
            return 0.0;
        }
        let mut haystack = format!("{} {} {}", intent.goal, intent.normalized_text, intent.raw_text);
        for v in intent.entities.values() {
            haystack.push(' ');
            haystack.push_str(v);
        }
        let haystack = haystack.to_lowercase();
        let hits = procedure
            .keywords
            .iter()
            .filter(|k| haystack.contains(&k.to_lowercase()))
            .count();
        hits as f32 / procedure.keywords.len() as f32
    }
}

#[async_trait]
impl KnowledgeRetriever for StaticKnowledgeBase {
    async fn retrieve_procedures(&self, intent: &Intent) -> Result<Vec<ScoredProcedure>, AssistError> {
        let procedures = self.procedures.read().await;
        let mut scored: Vec<ScoredProcedure> = procedures
            .iter()
            .map(|p| ScoredProcedure { procedure: p.clone(), confidence: Self::score(p, intent) })
            .filter(|s| s.confidence > 0.0)
            .collect();
        scored.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GoalPredicate, ProcedureStep, StepKind};
    use std::collections::BTreeMap;

    fn intent(goal: &str, app: &str) -> Intent {
        let mut entities = BTreeMap::new();
        entities.insert("app".to_string(), app.to_string());
        Intent {
            raw_text: format!("帮我打开{}", app),
            normalized_text: String::new(),
            goal: goal.into(),
            entities,
            confidence: 0.9,
            ambiguous: false,
            predicate: GoalPredicate::default(),
        }
    }

    #[tokio::test]
    async fn best_keyword_match_comes_first() {
        let open_wechat = Procedure::new("打开微信", vec![ProcedureStep::new(StepKind::OpenApp, "微信")])
            .with_keywords(["open_app", "微信"]);
        let call = Procedure::new("微信视频", vec![ProcedureStep::new(StepKind::Click, "视频通话")])
            .with_keywords(["video_call", "微信"]);
        let kb = StaticKnowledgeBase::new(vec![call, open_wechat]);
        let res = kb.retrieve_procedures(&intent("open_app", "微信")).await.unwrap();
        assert_eq!(res[0].procedure.title, "打开微信");
        assert!((res[0].confidence - 1.0).abs() < f32::EPSILON);
        assert!((res[1].confidence - 0.5).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn unrelated_procedures_are_not_returned() {
        let kb = StaticKnowledgeBase::new(vec![
            Procedure::new("设置字体", vec![]).with_keywords(["font", "字体"]),
        ]);
        assert!(kb.retrieve_procedures(&intent("open_app", "微信")).await.unwrap().is_empty());
    }
}
