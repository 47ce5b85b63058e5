use anyhow::Result;
use std::sync::Arc;
use steady_hands::snapshots::DiskSnapshotStore;
use steady_hands::{
    AssistConfig, ChromiumConfig, ChromiumScreen, Collaborators, ModelClient, ModelConfig, Orchestrator, Procedure,
    ProcedureStep, SessionProfile, SessionRegistry, StaticKnowledgeBase, StepKind, TechLevel,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn starter_procedures() -> Vec<Procedure> {
    vec![
        Procedure::new("打开微信", vec![ProcedureStep::new(StepKind::OpenApp, "微信").with_expected("微信")])
            .with_keywords(["open_app", "微信"]),
        Procedure::new(
            "看新闻",
            vec![
                ProcedureStep::new(StepKind::OpenApp, "新闻"),
                ProcedureStep::new(StepKind::Query, "新闻列表"),
            ],
        )
        .with_keywords(["news", "新闻"]),
        Procedure::new(
            "百度搜索",
            vec![
                ProcedureStep::new(StepKind::OpenApp, "百度"),
                ProcedureStep::new(StepKind::Click, "搜索框"),
            ],
        )
        .with_keywords(["search", "搜索"]),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let models = Arc::new(ModelClient::new(ModelConfig::default())?);
    let screen = Arc::new(ChromiumScreen::launch(ChromiumConfig::default()).await?);
    let runs_dir = std::env::temp_dir().join("steady_hands_runs");
    let collab = Collaborators::new(
        models.clone(),
        models.clone(),
        models,
        Arc::new(StaticKnowledgeBase::new(starter_procedures())),
        screen.clone(),
        screen,
    )
    .with_snapshot_store(Arc::new(DiskSnapshotStore::new(&runs_dir)));
    let orchestrator = Arc::new(Orchestrator::new(collab, AssistConfig::default()));
    let registry = SessionRegistry::new(orchestrator);

    let profile = SessionProfile {
        name: "王阿姨".into(),
        age: Some(72),
        tech_level: TechLevel::Beginner,
        ..Default::default()
    }
    .with_alias("老二", "张伟");
    let session = registry.open_session(profile).await;
    info!(session_id = %session, screenshots = %runs_dir.display(), "type a request, one per line");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let waiting = registry
            .get_state(&session)
            .await?
            .map(|s| s.state.awaits_user())
            .unwrap_or(false);
        if waiting {
            registry.submit_feedback(&session, line).await?;
            continue;
        }
        let handle = registry.submit_input(&session, line).await?;
        let mut updates = handle.subscribe();
        tokio::spawn(async move {
            let mut last = String::new();
            while updates.changed().await.is_ok() {
                let snap = updates.borrow_and_update().clone();
                let name = snap.state.name().to_string();
                if name != last {
                    println!("[{}] {}", snap.task_id, name);
                    if let Some(report) = snap.failure() {
                        println!("  {}", report.recovery_suggestion);
                    }
                    last = name;
                }
            }
        });
    }

    if let Some(last) = registry.close_session(&session).await? {
        info!(state = last.state.name(), "session closed");
    }
    Ok(())
}
