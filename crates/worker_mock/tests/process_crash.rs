//! Kept in its own test binary: it points the mock worker at a custom flow
//! file through the environment.

use std::time::Duration;

use flowbot::{ChannelObserver, ClientConfig, ExecutionState, Session};
use tokio::time::timeout;

const WORKER: &str = env!("CARGO_BIN_EXE_flowbot-worker");

#[tokio::test]
async fn worker_exit_mid_run_synthesizes_failed() {
    let dir = tempfile::tempdir().unwrap();
    let flows = dir.path().join("flows.json");
    std::fs::write(
        &flows,
        r#"[{"id":"crashy","name":"Crashy","crash_at":2,
             "steps":[{"state":"readyStart"},{"state":"running"},{"state":"completed","delay_ms":50}]}]"#,
    )
    .unwrap();
    unsafe { std::env::set_var("FLOWBOT_MOCK_FLOWS", &flows) };

    let session = Session::new(ClientConfig::default().with_worker_path(WORKER));
    session.open(None).await.unwrap();
    let list = session.get_flow_list().await.unwrap();
    assert_eq!(list[0].id, "crashy");

    let (observer, mut events) = ChannelObserver::new();
    session.execute(&list[0], observer).await.unwrap();

    let mut states = vec![];
    while let Ok(Some(event)) = timeout(Duration::from_secs(5), events.recv()).await {
        states.push((event.state, event.synthesized));
        if event.is_terminal() {
            break;
        }
    }
    assert_eq!(
        states,
        vec![
            (ExecutionState::ReadyStart, false),
            (ExecutionState::Running, false),
            (ExecutionState::Failed, true),
        ]
    );
    assert!(!session.is_executing());
    session.close().await;
}
