use std::sync::Arc;
use tracing::{info, warn};

use crate::capabilities::{InputAction, InputDevice, ScreenCapture};
use crate::config::AssistConfig;
use crate::error::AssistError;
use crate::retry::bounded;
use crate::types::{ExecutionReceipt, RawOutcome, Step, StepKind};

/// Maps a grounded step onto the concrete input event to issue.
pub fn action_for(step: &Step) -> Result<InputAction, AssistError> {
    let text = || step.input.clone().unwrap_or_else(|| step.target_description.clone());
    Ok(match step.kind {
        StepKind::Click => {
            let c = step
                .resolved_target
                .as_ref()
                .ok_or_else(|| AssistError::Internal("click step reached the executor ungrounded".into()))?;
            InputAction::Click { x: c.x, y: c.y }
        }
        StepKind::Type => InputAction::Type { text: text() },
        StepKind::Key => InputAction::Key { combo: text() },
        StepKind::OpenApp => InputAction::OpenApp { name: step.target_description.clone() },
        StepKind::Wait | StepKind::Query => InputAction::None,
    })
}

pub struct ActionExecutor {
    screen: Arc<dyn ScreenCapture>,
    device: Arc<dyn InputDevice>,
    cfg: AssistConfig,
}

impl ActionExecutor {
    pub fn new(screen: Arc<dyn ScreenCapture>, device: Arc<dyn InputDevice>, cfg: AssistConfig) -> Self {
        Self { screen, device, cfg }
    }

    /// Issues the step's input bracketed by two captures. Does not decide success.
    ///
    /// Input is never retried here: a half-delivered click cannot be taken back.
    pub async fn execute(&self, step: &mut Step) -> Result<ExecutionReceipt, AssistError> {
        let limit = self.cfg.collaborator_timeout;
        let before = bounded(limit, "capture", self.screen.capture()).await?;
        if let Some(c) = &step.resolved_target {
            if !c.is_valid_for(&before) {
                return Err(AssistError::GroundingNotFound(format!(
                    "screen changed from {:?} to {:?} since grounding",
                    c.screen,
                    before.resolution()
                )));
            }
        }
        let action = action_for(step)?;
        step.attempt_count += 1;

        let raw_outcome = if action == InputAction::None {
            RawOutcome { performed: true, message: None }
        } else {
            match bounded(limit, "perform", self.device.perform(&action)).await {
                Ok(()) => {
                    info!(action = ?action, attempt = step.attempt_count, "input issued");
                    RawOutcome { performed: true, message: None }
                }
                Err(e) => {
                    warn!(action = ?action, error = %e, "input device refused action");
                    RawOutcome { performed: false, message: Some(e.to_string()) }
                }
            }
        };

        let after = bounded(limit, "capture", self.screen.capture()).await?;
        Ok(ExecutionReceipt { screenshot_before: before, screenshot_after: after, raw_outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Coordinate, Screenshot, Tier};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Screen((u32, u32));

    #[async_trait]
    impl ScreenCapture for Screen {
        async fn capture(&self) -> Result<Screenshot, AssistError> {
            Ok(Screenshot::new(self.0 .0, self.0 .1, None, None))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<InputAction>>);

    #[async_trait]
    impl InputDevice for Recorder {
        async fn perform(&self, action: &InputAction) -> Result<(), AssistError> {
            self.0.lock().unwrap().push(action.clone());
            Ok(())
        }
    }

    fn grounded_click(screen: (u32, u32)) -> Step {
        let mut step = Step::new(StepKind::Click, "通讯录");
        step.resolved_target = Some(Coordinate { x: 120, y: 230, source_tier: Tier::Heavy, screen });
        step
    }

    #[tokio::test]
    async fn click_is_issued_at_the_grounded_point() {
        let device = Arc::new(Recorder::default());
        let ex = ActionExecutor::new(Arc::new(Screen((1280, 800))), device.clone(), AssistConfig::default());
        let mut step = grounded_click((1280, 800));
        let receipt = ex.execute(&mut step).await.unwrap();
        assert!(receipt.raw_outcome.performed);
        assert_eq!(step.attempt_count, 1);
        assert_eq!(*device.0.lock().unwrap(), vec![InputAction::Click { x: 120, y: 230 }]);
        assert_ne!(receipt.screenshot_before.id, receipt.screenshot_after.id);
    }

    #[tokio::test]
    async fn stale_coordinates_are_refused() {
        let device = Arc::new(Recorder::default());
        let ex = ActionExecutor::new(Arc::new(Screen((1920, 1080))), device.clone(), AssistConfig::default());
        let mut step = grounded_click((1280, 800));
        assert!(matches!(ex.execute(&mut step).await, Err(AssistError::GroundingNotFound(_))));
        assert!(device.0.lock().unwrap().is_empty());
    }

    #[test]
    fn ungrounded_click_has_no_action() {
        assert!(action_for(&Step::new(StepKind::Click, "x")).is_err());
        assert_eq!(
            action_for(&Step::new(StepKind::Key, "回车").with_input("Enter")).unwrap(),
            InputAction::Key { combo: "Enter".into() }
        );
    }
}
