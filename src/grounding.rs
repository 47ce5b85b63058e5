//! Two-tier grounding: a light classifier pass for every step, a heavy
//! localization pass only when a click needs a coordinate.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::capabilities::{ElementLocator, ScreenClassifier};
use crate::config::AssistConfig;
use crate::error::AssistError;
use crate::retry::{bounded, with_backoff};
use crate::types::{BoundingBox, Coordinate, ScreenClassification, Screenshot, Step, StepKind, Tier};

#[derive(Clone, Debug, PartialEq)]
pub enum Grounding {
    /// Step is ready to execute; `Some` for click-class steps.
    Resolved(Option<Coordinate>),
    Disambiguation(Vec<String>),
    NotFound(String),
}

#[derive(Clone, Debug)]
pub struct GroundingReport {
    pub result: Grounding,
    /// Tier-1 view the decision was made on.
    pub screen: ScreenClassification,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ElementMatch {
    One(String),
    Many(Vec<String>),
    None,
}

fn norm(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Matches a target description against tier-1 element descriptions.
/// Exact matches win; otherwise substring matches in either direction.
pub fn match_element(target: &str, elements: &[String]) -> ElementMatch {
    let t = norm(target);
    if t.is_empty() {
        return ElementMatch::None;
    }
    let exact: Vec<&String> = elements.iter().filter(|e| norm(e) == t).collect();
    if let Some(first) = exact.first() {
        return ElementMatch::One((*first).clone());
    }
    let mut loose: Vec<String> = Vec::new();
    for e in elements {
        let n = norm(e);
        if !n.is_empty() && (n.contains(&t) || t.contains(&n)) && !loose.contains(e) {
            loose.push(e.clone());
        }
    }
    match loose.len() {
        0 => ElementMatch::None,
        1 => ElementMatch::One(loose.remove(0)),
        _ => ElementMatch::Many(loose),
    }
}

/// The field a type or key step writes into. Without separate input text the
/// target is the text or key combo itself, so there is no field to look for.
fn input_field(step: &Step) -> Option<&str> {
    match step.kind {
        StepKind::Type | StepKind::Key if step.input.is_some() => {
            Some(step.target_description.trim()).filter(|f| !f.is_empty())
        }
        _ => None,
    }
}

pub struct GroundingStage {
    classifier: Arc<dyn ScreenClassifier>,
    locator: Arc<dyn ElementLocator>,
    cfg: AssistConfig,
    // Tier-1 result of the most recent screenshot, keyed by screenshot id.
    last: Mutex<Option<(String, ScreenClassification)>>,
}

impl GroundingStage {
    pub fn new(classifier: Arc<dyn ScreenClassifier>, locator: Arc<dyn ElementLocator>, cfg: AssistConfig) -> Self {
        Self { classifier, locator, cfg, last: Mutex::new(None) }
    }

    /// Tier 1. Repeated calls for the same screenshot reuse the first answer.
    pub async fn classify(&self, shot: &Screenshot) -> Result<ScreenClassification, AssistError> {
        if let Some((id, screen)) = self.last.lock().await.as_ref() {
            if *id == shot.id {
                return Ok(screen.clone());
            }
        }
        let limit = self.cfg.collaborator_timeout;
        let screen = with_backoff(&self.cfg.retry, "classify_screen", || {
            bounded(limit, "classify_screen", self.classifier.classify_screen(shot))
        })
        .await?;
        *self.last.lock().await = Some((shot.id.clone(), screen.clone()));
        Ok(screen)
    }

    /// Resolves `step` against `shot`, filling `resolved_target` only on a heavy-tier hit.
    pub async fn ground(&self, step: &mut Step, shot: &Screenshot) -> Result<GroundingReport, AssistError> {
        step.resolved_target = None;
        let screen = self.classify(shot).await?;
        debug!(app = %screen.app, page = %screen.page_state, elements = screen.elements.len(), "tier-1 classification");

        if !step.kind.needs_coordinate() {
            if let Some(field) = input_field(step) {
                if match_element(field, &screen.elements) == ElementMatch::None && !screen.mentions(field) {
                    let reason = format!("nowhere to enter text: \"{}\" is not on the {} screen", field, screen.app);
                    return Ok(GroundingReport { result: Grounding::NotFound(reason), screen });
                }
            }
            return Ok(GroundingReport { result: Grounding::Resolved(None), screen });
        }

        let element = match match_element(&step.target_description, &screen.elements) {
            ElementMatch::One(e) => e,
            ElementMatch::Many(candidates) => {
                info!(target = %step.target_description, candidates = candidates.len(), "several elements match");
                return Ok(GroundingReport { result: Grounding::Disambiguation(candidates), screen });
            }
            ElementMatch::None => {
                let reason = format!("\"{}\" is not on the {} screen", step.target_description, screen.app);
                return Ok(GroundingReport { result: Grounding::NotFound(reason), screen });
            }
        };

        match self.locate(shot, &element).await {
            Ok(bbox) => {
                let (x, y) = bbox.center();
                let coord = Coordinate { x, y, source_tier: Tier::Heavy, screen: shot.resolution() };
                info!(target = %element, x, y, "element grounded");
                step.resolved_target = Some(coord.clone());
                Ok(GroundingReport { result: Grounding::Resolved(Some(coord)), screen })
            }
            Err(e) => {
                warn!(target = %element, error = %e, "tier-2 localization failed");
                Ok(GroundingReport {
                    result: Grounding::NotFound(format!("could not pinpoint \"{}\": {}", element, e)),
                    screen,
                })
            }
        }
    }

    async fn locate(&self, shot: &Screenshot, description: &str) -> Result<BoundingBox, AssistError> {
        let limit = self.cfg.collaborator_timeout;
        let (w, h) = shot.resolution();
        with_backoff(&self.cfg.retry, "locate_element", || async move {
            let bbox = bounded(limit, "locate_element", self.locator.locate_element(shot, description)).await?;
            let (cx, cy) = bbox.center();
            let on_screen = (w == 0 || cx < w as i64) && (h == 0 || cy < h as i64);
            if !bbox.is_well_formed() || !on_screen {
                return Err(AssistError::CollaboratorUnavailable(format!("implausible bounding box {:?}", bbox)));
            }
            Ok(bbox)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Fixed(ScreenClassification, AtomicU32);

    #[async_trait]
    impl ScreenClassifier for Fixed {
        async fn classify_screen(&self, _shot: &Screenshot) -> Result<ScreenClassification, AssistError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.clone())
        }
    }

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ElementLocator for Flaky {
        async fn locate_element(&self, _shot: &Screenshot, _d: &str) -> Result<BoundingBox, AssistError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(AssistError::CollaboratorUnavailable("busy".into()))
            } else {
                Ok(BoundingBox { x1: 100, y1: 200, x2: 140, y2: 260 })
            }
        }
    }

    fn stage(elements: &[&str], failures: u32) -> (GroundingStage, Arc<Fixed>, Arc<Flaky>) {
        let classifier = Arc::new(Fixed(
            ScreenClassification {
                app: "微信".into(),
                page_state: "chat list".into(),
                elements: elements.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            AtomicU32::new(0),
        ));
        let locator = Arc::new(Flaky { failures, calls: AtomicU32::new(0) });
        let mut cfg = AssistConfig::default();
        cfg.retry.max_retries = 2;
        cfg.retry.base_delay = Duration::from_millis(100);
        (GroundingStage::new(classifier.clone(), locator.clone(), cfg), classifier, locator)
    }

    #[tokio::test(start_paused = true)]
    async fn click_target_resolves_to_bbox_center() {
        let (g, _, locator) = stage(&["通讯录", "搜索"], 1);
        let shot = Screenshot::new(1280, 800, None, None);
        let mut step = Step::new(StepKind::Click, "通讯录");
        let report = g.ground(&mut step, &shot).await.unwrap();
        let coord = step.resolved_target.clone().unwrap();
        assert_eq!((coord.x, coord.y), (120, 230));
        assert_eq!(coord.source_tier, Tier::Heavy);
        assert_eq!(coord.screen, (1280, 800));
        assert_eq!(report.result, Grounding::Resolved(Some(coord)));
        assert_eq!(locator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_tier_two_retries_yield_not_found() {
        let (g, _, locator) = stage(&["通讯录"], 10);
        let shot = Screenshot::new(1280, 800, None, None);
        let mut step = Step::new(StepKind::Click, "通讯录");
        let report = g.ground(&mut step, &shot).await.unwrap();
        assert!(matches!(report.result, Grounding::NotFound(_)));
        assert!(step.resolved_target.is_none());
        assert_eq!(locator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_click_steps_skip_tier_two() {
        let (g, _, locator) = stage(&[], 0);
        let shot = Screenshot::new(1280, 800, None, None);
        let mut step = Step::new(StepKind::OpenApp, "微信");
        let report = g.ground(&mut step, &shot).await.unwrap();
        assert_eq!(report.result, Grounding::Resolved(None));
        assert_eq!(locator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn typing_needs_the_field_on_screen() {
        let (g, _, locator) = stage(&["通讯录", "视频通话"], 0);
        let shot = Screenshot::new(1280, 800, None, None);
        let mut step = Step::new(StepKind::Type, "搜索框").with_input("张三");
        let report = g.ground(&mut step, &shot).await.unwrap();
        assert!(matches!(report.result, Grounding::NotFound(ref r) if r.contains("搜索框")), "got {:?}", report.result);

        let (g, _, _) = stage(&["搜索框", "通讯录"], 0);
        let report = g.ground(&mut step, &shot).await.unwrap();
        assert_eq!(report.result, Grounding::Resolved(None));

        // A bare key press names the key, not a field.
        let mut enter = Step::new(StepKind::Key, "Enter");
        assert_eq!(g.ground(&mut enter, &shot).await.unwrap().result, Grounding::Resolved(None));
        assert_eq!(locator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn several_plausible_elements_ask_the_user() {
        let (g, _, _) = stage(&["张三 (同事)", "张三 (老同学)", "李四"], 0);
        let shot = Screenshot::new(1280, 800, None, None);
        let mut step = Step::new(StepKind::Click, "张三");
        let report = g.ground(&mut step, &shot).await.unwrap();
        assert_eq!(
            report.result,
            Grounding::Disambiguation(vec!["张三 (同事)".to_string(), "张三 (老同学)".to_string()])
        );
    }

    #[tokio::test]
    async fn tier_one_is_reused_for_the_same_screenshot() {
        let (g, classifier, _) = stage(&["搜索"], 0);
        let shot = Screenshot::new(1280, 800, None, None);
        g.classify(&shot).await.unwrap();
        let mut step = Step::new(StepKind::Type, "搜索").with_input("天气");
        g.ground(&mut step, &shot).await.unwrap();
        assert_eq!(classifier.1.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exact_match_beats_substring_matches() {
        let els = vec!["设置".to_string(), "设置中心".to_string()];
        assert_eq!(match_element("设置", &els), ElementMatch::One("设置".into()));
        assert_eq!(match_element("音量", &els), ElementMatch::None);
    }
}
