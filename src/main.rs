use anyhow::Result;
use std::time::Duration;

use stream_load::config::Config;
use stream_load::dispatcher::Dispatcher;
use stream_load::health;
use stream_load::mock_server::MockCompletionServer;
use stream_load::prompts;
use stream_load::report::{self, Report};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let mut config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("🚀 Stream Load starting...");

    let prompts = prompts::load_prompts(config.prompts_file.as_deref())?;

    // Standalone mode: benchmark against the built-in mock server
    let mut mock_server = None;
    if let Some(mock_config) = config.standalone.clone() {
        let mut server = MockCompletionServer::new(mock_config);
        server.start().await?;
        config.base_url = server.url();
        mock_server = Some(server);
    }

    // Pre-flight health check - fail fast before generating any load
    if let Err(e) = health::check_health(&config.base_url, config.health_timeout).await {
        tracing::error!("❌ {}", e);
        tracing::error!("");
        tracing::error!("🔧 Troubleshooting steps:");
        tracing::error!("   1. Check that the completion server is running");
        tracing::error!("   2. Verify the URL ({})", config.base_url);
        tracing::error!("   3. If the server runs in a cluster, check the port-forward");
        tracing::error!("");
        anyhow::bail!("Startup failed: endpoint is not healthy");
    }
    tracing::info!("✅ Endpoint healthy");

    print_startup_banner(&config, prompts.len());

    let dispatcher = Dispatcher::new(config.run_config(), prompts)?;
    let run = dispatcher.run_until(stop_after(config.duration)).await?;

    if let Some(mut server) = mock_server {
        server.stop();
    }

    let report = Report::from_run(run);
    report::print_summary(&report.metrics);
    for advisory in &report.advisories {
        tracing::warn!("{}", advisory);
    }

    if let Some(path) = &config.output_path {
        report::write_report_atomic(path, &report)?;
        println!("  Results written to: {}", path.display());
    }

    Ok(())
}

/// Print startup banner
fn print_startup_banner(config: &Config, prompt_count: usize) {
    println!();
    println!("  Version:     {}", env!("CARGO_PKG_VERSION"));
    println!("  Endpoint:    {}", config.base_url);
    println!("  Model:       {}", config.model);
    println!("  Concurrency: {}", config.concurrency);
    println!("  Duration:    {}s", config.duration.as_secs());
    println!("  Max tokens:  {}", config.max_tokens);
    println!("  Prompts:     {}", prompt_count);
    if config.standalone.is_some() {
        println!("  Mode:        standalone (mock server)");
    }
    println!();
}

/// Resolve when the test duration has elapsed or the user interrupts
async fn stop_after(duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {
            tracing::info!("Test duration elapsed");
        },
        _ = shutdown_signal() => {},
    }
}

/// Handle Ctrl+C / SIGTERM. Stopping early still drains in-flight requests.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, stopping early...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, stopping early...");
        },
    }
}
