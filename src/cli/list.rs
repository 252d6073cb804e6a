use flowbot::runtime::run_blocking;
use flowbot::{BlockingSession, Session};

use super::{CliContext, print_flows};

pub fn execute(context: &CliContext) -> anyhow::Result<()> {
    let work_path = context.work_path.as_deref();
    let flows = if context.blocking {
        let session = BlockingSession::new(context.config.clone())?;
        session.open(work_path)?;
        let flows = session.get_flow_list();
        session.close();
        flows?
    } else {
        run_blocking(async {
            let session = Session::new(context.config.clone());
            session.open(work_path).await?;
            let flows = session.get_flow_list().await;
            session.close().await;
            flows
        })??
    };
    print_flows(&flows);
    Ok(())
}
