use std::env;
use std::path::PathBuf;

use worker_protocol::worker_runtime::run;
use worker_protocol::worker_test_util::ScriptedWorker;

/// JSON file with the scripted flows; the built-in demo flows otherwise.
const FLOWS_ENV: &str = "FLOWBOT_MOCK_FLOWS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let worker = match env::var_os(FLOWS_ENV).map(PathBuf::from) {
        Some(path) => ScriptedWorker::from_json_file(&path)?,
        None => ScriptedWorker::demo(),
    };
    run(worker).await
}
