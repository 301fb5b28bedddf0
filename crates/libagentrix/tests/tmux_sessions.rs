//! Tests against a real tmux server. Skipped when tmux is not installed.

use std::time::Duration;

use agentrix_protocol::{SessionIdentity, SessionKind, SpawnMode};
use libagentrix::{CloseOptions, RegistryConfig, SessionRegistry, SpawnOptions, tmux};

fn unique_identity() -> SessionIdentity {
    let suffix = unique_suffix();
    SessionIdentity::new("agentrix-test", "tmux", format!("branch-{suffix}"))
}

fn unique_suffix() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        .to_string()
}

fn tmux_options(dir: &std::path::Path) -> SpawnOptions {
    let mut options = SpawnOptions::new(SessionKind::Interactive, dir);
    options.mode = Some(SpawnMode::Tmux);
    options
}

#[tokio::test]
async fn local_close_keeps_tmux_session_and_reattach_reuses_it() {
    if !tmux::is_available().await {
        eprintln!("tmux not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(RegistryConfig {
        ready_delay: Duration::from_millis(50),
        ..RegistryConfig::default()
    });
    let identity = unique_identity();

    let first = registry
        .spawn(identity.clone(), tmux_options(dir.path()))
        .await
        .expect("spawn tmux session");
    assert!(first.created);
    let name = first
        .session
        .tmux_session_name()
        .expect("tmux name")
        .to_string();
    assert!(first.session.using_tmux());

    registry
        .close(first.session.id(), CloseOptions { close_remote: false })
        .await
        .unwrap();
    assert!(tmux::has_session(&name).await.unwrap(), "tmux session should survive");

    let second = registry
        .spawn(identity.clone(), tmux_options(dir.path()))
        .await
        .expect("reattach");
    assert!(!second.created);
    assert_eq!(second.session.tmux_session_name(), Some(name.as_str()));

    registry
        .close(second.session.id(), CloseOptions { close_remote: true })
        .await
        .unwrap();
    assert!(!tmux::has_session(&name).await.unwrap());
}

#[tokio::test]
async fn live_automation_tmux_session_is_not_reused_after_restart() {
    if !tmux::is_available().await {
        eprintln!("tmux not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let config = RegistryConfig {
        ready_delay: Duration::from_millis(50),
        ..RegistryConfig::default()
    };
    let identity = unique_identity();
    let mut options = SpawnOptions::new(SessionKind::Automation, dir.path());
    options.mode = Some(SpawnMode::Tmux);
    options.command = Some("sleep 30".to_string());

    let before_restart = SessionRegistry::new(config.clone());
    let first = before_restart
        .spawn(identity.clone(), options.clone())
        .await
        .expect("spawn agent in tmux");
    let name = first
        .session
        .tmux_session_name()
        .expect("tmux name")
        .to_string();
    before_restart.shutdown().await;
    assert!(tmux::has_session(&name).await.unwrap(), "agent keeps running");

    let after_restart = SessionRegistry::new(config);
    let second = after_restart.spawn(identity, options).await;
    assert!(matches!(second, Err(libagentrix::AgentrixError::Conflict(_))));

    tmux::kill_session(&name).await.unwrap();
}
