mod args;

use args::Cli;
use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;
use svcrt::lifecycle::Value;
use svcrt::{
    clienv, BackendRegistry, CommandResult, LaunchOptions, Service, ServiceConfig, ServiceHooks,
    TerminalDecision, TerminalInfo,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "svcrt";

/// Minimal service: logs its lifecycle and accepts every authorized terminal.
struct DemoService;

#[async_trait]
impl ServiceHooks for DemoService {
    async fn on_start(&self) -> CommandResult {
        info!("Demo service started");
        CommandResult::Completed
    }

    async fn on_stop(&self, exit_code: &mut i32) -> CommandResult {
        info!("Demo service stopping");
        *exit_code = 0;
        CommandResult::Completed
    }

    async fn on_reload(&self) -> CommandResult {
        info!("Demo service reloaded");
        CommandResult::Completed
    }

    fn terminal_connected(&self, terminal: &TerminalInfo) -> TerminalDecision {
        info!(terminal = terminal.id, scope = ?terminal.scope, "Terminal attached");
        TerminalDecision::Accept
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(clienv::log_filter()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::load(SERVICE_NAME)?;

    let service = Service::new(SERVICE_NAME, Arc::new(DemoService), BackendRegistry::with_defaults())?;
    service.apply_config(&config);
    service.add_callback("echo", |args: &[Value]| {
        Value::Text(
            args.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" "),
        )
    })?;

    let options = LaunchOptions {
        backend: config.resolve_backend(cli.backend.as_deref()),
        terminal: cli.terminal,
        args: cli.args,
    };
    let code = service.exec(options).await;

    drop(service);
    std::process::exit(code);
}
