use std::path::Path;
use std::time::Duration;

use flowbot::{
    BlockingSession, ChannelObserver, ClientConfig, ClientError, ConnectError, ExecutionState,
    Session, StatusEvent,
};
use tokio::time::timeout;

const WORKER: &str = env!("CARGO_BIN_EXE_flowbot-worker");

fn config() -> ClientConfig {
    ClientConfig {
        handshake_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        close_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn worker_process_runs_the_first_flow() {
    let session = Session::new(config());
    let install_dir = Path::new(WORKER).parent().unwrap();
    session.open(Some(install_dir)).await.unwrap();
    assert!(session.is_open());
    assert!(session.worker_info().unwrap().worker_version.ends_with("-scripted"));

    let flows = session.get_flow_list().await.unwrap();
    assert!(!flows.is_empty());

    let (observer, mut events) = ChannelObserver::new();
    session.execute(&flows[0], observer).await.unwrap();
    let mut states = vec![];
    while let Ok(Some(event)) = timeout(Duration::from_secs(5), events.recv()).await {
        states.push(event.state);
        if event.is_terminal() {
            break;
        }
    }
    assert_eq!(
        states,
        vec![ExecutionState::ReadyStart, ExecutionState::Running, ExecutionState::Completed]
    );
    assert!(!session.is_executing());

    session.close().await;
    assert!(!session.is_open());
}

#[tokio::test]
async fn closing_a_process_session_aborts_the_run() {
    let session = Session::new(config());
    session.open(Some(Path::new(WORKER))).await.unwrap();
    let flows = session.get_flow_list().await.unwrap();
    let long = flows.iter().find(|f| f.id == "nightly-report").unwrap();

    let (observer, mut events) = ChannelObserver::new();
    session.execute(long, observer).await.unwrap();
    let first = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    assert_eq!(first.state, ExecutionState::ReadyStart);

    session.close().await;
    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    let last = last.expect("terminal event delivered by close");
    assert_eq!(last.state, ExecutionState::Aborted);
    assert!(last.synthesized);
}

#[tokio::test]
async fn missing_worker_is_a_connect_error() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(config());
    let err = session.open(Some(dir.path())).await.unwrap_err();
    assert!(matches!(err, ClientError::Connect(ConnectError::WorkerNotFound(_))));
    assert!(!session.is_open());
}

#[test]
fn blocking_session_against_the_process() {
    let session = BlockingSession::new(config()).unwrap();
    session.open(Some(Path::new(WORKER))).unwrap();
    assert!(session.health().unwrap().healthy);

    let flows = session.get_flow_list().unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    session
        .execute(&flows[0], move |event: &StatusEvent| {
            let _ = tx.send(event.state);
        })
        .unwrap();

    let mut states = vec![];
    while let Ok(state) = rx.recv_timeout(Duration::from_secs(5)) {
        states.push(state);
        if state.is_terminal() {
            break;
        }
    }
    assert_eq!(states.last(), Some(&ExecutionState::Completed));
    assert!(!session.is_executing());
    session.close();
}
