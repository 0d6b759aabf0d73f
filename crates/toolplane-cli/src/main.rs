//! `toolplane` -- local tool control plane over stdio.
//!
//! Subcommands:
//!
//! - `toolplane serve` -- serve tools to an MCP client on stdin/stdout.
//! - `toolplane tools` -- print the advertised tool catalog.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use toolplane_core::{BoundedExecutor, BreakerConfig, BreakerRegistry};
use toolplane_server::{Dispatcher, EchoTool, StatusTool, ToolRegistry};
use toolplane_types::Config;

mod config;

/// Local tool control plane.
#[derive(Parser)]
#[command(name = "toolplane", about = "Local tool control plane over stdio", version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Serve tools to an MCP client on stdin/stdout.
    Serve(ServeArgs),

    /// Print the advertised tool catalog.
    Tools(ToolsArgs),
}

/// Arguments for `toolplane serve`.
#[derive(Args)]
struct ServeArgs {
    /// Config file path (overrides auto-discovery).
    #[arg(short, long)]
    config: Option<String>,
}

/// Arguments for `toolplane tools`.
#[derive(Args)]
struct ToolsArgs {
    /// Config file path (overrides auto-discovery).
    #[arg(short, long)]
    config: Option<String>,

    /// Also start external servers to include their tools.
    #[arg(long)]
    start_external: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol; all logging goes to stderr.
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => {
            let cfg = config::load(args.config.as_deref())?;
            serve(cfg).await?;
        }
        Commands::Tools(args) => {
            let cfg = config::load(args.config.as_deref())?;
            print_tools(cfg, args.start_external).await;
        }
    }

    Ok(())
}

/// Build the registry, breakers, and executor from config.
fn build(config: &Config) -> (ToolRegistry, Arc<BreakerRegistry>, BoundedExecutor) {
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::from(&config.breaker)));
    let executor = BoundedExecutor::new(Duration::from_secs(config.executor.budget_secs));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool));
    registry.register(Arc::new(StatusTool::new(
        config.server.clone(),
        Arc::clone(&breakers),
    )));
    for spec in &config.external {
        registry.add_external(spec.clone());
    }

    (registry, breakers, executor)
}

/// Run the stdio serving loop until EOF or ctrl-c.
async fn serve(config: Config) -> anyhow::Result<()> {
    let (registry, breakers, executor) = build(&config);
    let registry = Arc::new(registry);
    registry.autostart().await;

    info!(
        server = %config.server.name,
        external = config.external.len(),
        "serving on stdio"
    );

    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        breakers,
        executor,
        config.server.clone(),
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    dispatcher.run(stdin, stdout, cancel).await?;

    info!("session ended");
    Ok(())
}

/// Print every advertised tool, one block per tool.
async fn print_tools(config: Config, start_external: bool) {
    let (registry, _breakers, _executor) = build(&config);
    if start_external {
        registry.autostart().await;
    }

    let tools = registry.list_all_tools().await;
    println!("Available tools ({}):", tools.len());
    for tool in tools {
        println!("  {}", tool.name);
        println!("    {}", tool.description);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_without_error() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_has_all_subcommands() {
        let cmd = Cli::command();
        let sub_names: Vec<&str> = cmd.get_subcommands().map(|s| s.get_name()).collect();
        assert!(sub_names.contains(&"serve"));
        assert!(sub_names.contains(&"tools"));
    }

    #[test]
    fn cli_verbose_flag_is_global() {
        let cli = Cli::parse_from(["toolplane", "serve", "--verbose"]);
        assert!(cli.verbose);
    }

    #[test]
    fn build_registers_builtin_tools_and_externals() {
        let mut config = Config::default();
        config.external.push(toolplane_types::ProcessSpec {
            name: "kg".into(),
            command: "kg-server".into(),
            args: vec![],
            env: Default::default(),
            autostart: false,
        });

        let (registry, _, executor) = build(&config);
        assert!(matches!(
            registry.resolve("echo"),
            toolplane_server::ToolOwner::Internal(_)
        ));
        assert!(matches!(
            registry.resolve("status"),
            toolplane_server::ToolOwner::Internal(_)
        ));
        assert!(matches!(
            registry.resolve("kg__anything"),
            toolplane_server::ToolOwner::Lazy(_)
        ));
        assert_eq!(executor.budget(), Duration::from_secs(30));
    }
}
