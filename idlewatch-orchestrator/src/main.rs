use dotenv::dotenv;
use idlewatch_orchestrator::idle_pass::IdlePass;
use idlewatch_orchestrator::settings::Settings;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Exit status after an operator interrupt (128 + SIGINT).
const INTERRUPTED: u8 = 130;

// Dependency targets that are chatty at info/debug.
const QUIET_TARGETS: &str = "aws_config=warn,aws_smithy_runtime=warn,aws_smithy_runtime_api=warn,aws_sdk_ec2=warn,hyper=warn,hyper_util=warn,reqwest=warn";

fn init_tracing() {
    let base = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(format!("{},{}", base, QUIET_TARGETS))
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{}", QUIET_TARGETS)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    init_tracing();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("❌ configuration error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 interrupt received, stopping workers");
            on_signal.cancel();
        }
    });

    let pass = match IdlePass::from_settings(&settings).await {
        Ok(pass) => pass,
        Err(e) => {
            error!("❌ idle pass setup failed: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match pass.run(cancel.clone()).await {
        Ok(report) if report.cancelled => ExitCode::from(INTERRUPTED),
        Ok(_) if cancel.is_cancelled() => ExitCode::from(INTERRUPTED),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ idle pass failed: {:#}", e);
            if cancel.is_cancelled() {
                ExitCode::from(INTERRUPTED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
