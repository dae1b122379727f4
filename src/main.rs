use edge_export::bootstrap::{self, BootstrapResult};
use edge_export::parse_input;
use std::process::ExitCode;
use tokio::io::AsyncReadExt;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error + Send + Sync>> {
    let BootstrapResult {
        flags,
        runner,
        logging_guard: _logging_guard,
        ..
    } = bootstrap::default_init()?;

    if runner.pipelines().is_empty() {
        tracing::warn!("no pipelines configured, nothing to export");
        return Ok(ExitCode::SUCCESS);
    }

    let resent = runner.resend_pending().await;
    if !resent.is_empty() {
        let delivered = resent.iter().filter(|o| o.result.is_ok()).count();
        tracing::info!(total = resent.len(), delivered, "resent staged payloads");
    }

    let raw = match flags.input_path.as_deref() {
        Some(path) => tokio::fs::read(path).await?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            buf
        }
    };
    if raw.is_empty() {
        tracing::info!("empty input, only staged payloads were processed");
        return Ok(ExitCode::SUCCESS);
    }

    let outcomes = runner.run(&parse_input(raw)).await;
    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    for outcome in outcomes.iter().filter(|o| o.staged.is_some()) {
        if let Some(path) = outcome.staged.as_deref() {
            tracing::info!(pipeline_id = %outcome.pipeline_id, path = %path.display(), "payload kept for retry");
        }
    }
    tracing::info!(pipelines = outcomes.len(), failed, "export finished");

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
