use nanoid::nanoid;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::AssistError;
use crate::intent::{sanitize_input, SessionProfile};
use crate::orchestrator::{Orchestrator, TaskContext};
use crate::types::{SessionId, Task, TaskId, TaskSnapshot};

/// Caller's view of a submitted task.
pub struct TaskHandle {
    pub task_id: TaskId,
    updates: watch::Receiver<TaskSnapshot>,
}

impl TaskHandle {
    pub fn snapshot(&self) -> TaskSnapshot {
        self.updates.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.updates.clone()
    }

    /// Waits until `pred` holds for the latest snapshot, or the task stops publishing.
    pub async fn wait_until<F>(&mut self, pred: F) -> TaskSnapshot
    where
        F: Fn(&TaskSnapshot) -> bool,
    {
        loop {
            {
                let current = self.updates.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            if self.updates.changed().await.is_err() {
                return self.updates.borrow().clone();
            }
        }
    }

    pub async fn wait_terminal(&mut self) -> TaskSnapshot {
        self.wait_until(|s| s.state.is_terminal()).await
    }
}

struct ActiveTask {
    task_id: TaskId,
    cancel: CancellationToken,
    join: JoinHandle<TaskSnapshot>,
    updates: watch::Receiver<TaskSnapshot>,
}

struct Session {
    profile: SessionProfile,
    feedback_tx: mpsc::UnboundedSender<String>,
    feedback_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    closed: CancellationToken,
    active: Option<ActiveTask>,
    last: Option<TaskSnapshot>,
}

impl Session {
    /// Cancels the active task, if any, and waits for its terminal snapshot.
    async fn stop_active(&mut self) -> Option<TaskSnapshot> {
        let active = self.active.take()?;
        active.cancel.cancel();
        let snapshot = match active.join.await {
            Ok(s) => s,
            Err(e) => {
                warn!(task_id = %active.task_id, error = %e, "task runner ended abnormally");
                active.updates.borrow().clone()
            }
        };
        self.last = Some(snapshot.clone());
        Some(snapshot)
    }
}

/// Explicit registry of sessions; each owns at most one active task and a feedback queue.
pub struct SessionRegistry {
    orchestrator: Arc<Orchestrator>,
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<Session>>>>,
}

impl SessionRegistry {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator, sessions: Mutex::new(HashMap::new()) }
    }

    pub async fn open_session(&self, profile: SessionProfile) -> SessionId {
        let id: SessionId = nanoid!();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let session = Session {
            profile,
            feedback_tx,
            feedback_rx: Arc::new(Mutex::new(feedback_rx)),
            closed: CancellationToken::new(),
            active: None,
            last: None,
        };
        self.sessions.lock().await.insert(id.clone(), Arc::new(Mutex::new(session)));
        info!(session_id = %id, "session opened");
        id
    }

    async fn session(&self, session_id: &str) -> Result<Arc<Mutex<Session>>, AssistError> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AssistError::InvalidInput(format!("unknown session {}", session_id)))
    }

    /// Starts a task for `text`. A task already running in the session is
    /// abandoned first, and has reached its terminal state before this returns.
    pub async fn submit_input(&self, session_id: &str, text: &str) -> Result<TaskHandle, AssistError> {
        let text = sanitize_input(text, self.orchestrator.config().max_input_chars)?;
        let session = self.session(session_id).await?;
        let mut session = session.lock().await;
        if let Some(prev) = session.stop_active().await {
            info!(session_id, task_id = %prev.task_id, state = prev.state.name(), "previous task superseded");
        }

        let task = Task::new(session_id, text);
        let task_id = task.id.clone();
        let (updates_tx, updates_rx) = watch::channel(task.snapshot());
        let cancel = session.closed.child_token();
        let ctx = TaskContext {
            profile: session.profile.clone(),
            feedback: session.feedback_rx.clone(),
            updates: updates_tx,
            cancel: cancel.clone(),
        };
        let orchestrator = self.orchestrator.clone();
        let join = tokio::spawn(async move { orchestrator.run(task, &ctx).await });
        info!(session_id, task_id = %task_id, "task submitted");

        session.active = Some(ActiveTask { task_id: task_id.clone(), cancel, join, updates: updates_rx.clone() });
        Ok(TaskHandle { task_id, updates: updates_rx })
    }

    /// Queues feedback; the running task reads it at its next planning
    /// transition, or immediately when it is waiting on the user.
    pub async fn submit_feedback(&self, session_id: &str, text: &str) -> Result<(), AssistError> {
        let text = sanitize_input(text, self.orchestrator.config().max_input_chars)?;
        let session = self.session(session_id).await?;
        let session = session.lock().await;
        session
            .feedback_tx
            .send(text)
            .map_err(|_| AssistError::Internal("feedback queue closed".into()))
    }

    pub async fn get_state(&self, session_id: &str) -> Result<Option<TaskSnapshot>, AssistError> {
        let session = self.session(session_id).await?;
        let session = session.lock().await;
        Ok(match &session.active {
            Some(active) => Some(active.updates.borrow().clone()),
            None => session.last.clone(),
        })
    }

    /// Closes the session, abandoning its running task.
    pub async fn close_session(&self, session_id: &str) -> Result<Option<TaskSnapshot>, AssistError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| AssistError::InvalidInput(format!("unknown session {}", session_id)))?;
        let mut session = session.lock().await;
        session.closed.cancel();
        let last = session.stop_active().await.or_else(|| session.last.clone());
        info!(session_id, "session closed");
        Ok(last)
    }
}
