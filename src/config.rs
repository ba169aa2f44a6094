use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatcher::RunConfig;
use crate::executor::ExecutorConfig;
use crate::mock_server::MockServerConfig;

/// Streaming load generator for OpenAI-compatible completion endpoints
#[derive(Parser, Debug)]
#[command(name = "stream-load", author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the completion server
    #[arg(long, env = "STREAM_LOAD_URL", default_value = "http://localhost:8000")]
    pub url: String,

    /// Model name for API requests
    #[arg(
        short = 'm',
        long,
        env = "STREAM_LOAD_MODEL",
        default_value = "Qwen/Qwen2.5-0.5B-Instruct"
    )]
    pub model: String,

    /// Number of concurrent workers
    #[arg(short = 'c', long, env = "STREAM_LOAD_CONCURRENCY", default_value = "4")]
    pub concurrency: usize,

    /// Test duration in seconds
    #[arg(short = 'd', long, env = "STREAM_LOAD_DURATION", default_value = "30")]
    pub duration: u64,

    /// Max tokens per completion
    #[arg(long, env = "STREAM_LOAD_MAX_TOKENS", default_value = "100")]
    pub max_tokens: u32,

    /// Path for the JSON results file
    #[arg(short = 'o', long, env = "STREAM_LOAD_OUTPUT")]
    pub output: Option<String>,

    /// File with one prompt per line
    #[arg(long, env = "STREAM_LOAD_PROMPTS_FILE")]
    pub prompts_file: Option<String>,

    /// Per-request timeout in seconds (connect, first byte, and between chunks)
    #[arg(long, env = "STREAM_LOAD_REQUEST_TIMEOUT", default_value = "120")]
    pub request_timeout: u64,

    /// Health check timeout in seconds
    #[arg(long, env = "STREAM_LOAD_HEALTH_TIMEOUT", default_value = "5")]
    pub health_timeout: u64,

    /// Seed for prompt selection
    #[arg(long, env = "STREAM_LOAD_SEED")]
    pub seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Start the built-in mock server and run against it
    #[arg(long)]
    pub standalone: bool,

    /// Mock server delay between chunks in milliseconds
    #[arg(long, default_value = "5")]
    pub mock_chunk_latency_ms: u64,

    /// Mock server chunks per completion
    #[arg(long, default_value = "20")]
    pub mock_chunk_count: usize,

    /// Mock server error rate (0.0 to 1.0)
    #[arg(long, default_value = "0.0")]
    pub mock_error_rate: f64,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Target
    pub base_url: String,
    pub model: String,

    // Load shape
    pub concurrency: usize,
    pub duration: Duration,
    pub max_tokens: u32,
    pub seed: Option<u64>,

    // Timeouts
    pub request_timeout: Duration,
    pub health_timeout: Duration,

    // Files
    pub output_path: Option<PathBuf>,
    pub prompts_file: Option<PathBuf>,

    pub log_level: String,

    /// Mock server settings when running standalone
    pub standalone: Option<MockServerConfig>,
}

impl Config {
    /// Load configuration with priority: CLI > ENV (.env included) > defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Ok(Self::from_args(CliArgs::parse()))
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: CliArgs) -> Self {
        let standalone = args.standalone.then(|| MockServerConfig {
            chunk_latency_ms: args.mock_chunk_latency_ms,
            chunk_count: args.mock_chunk_count,
            error_rate: args.mock_error_rate,
            ..Default::default()
        });

        Config {
            base_url: args.url.trim_end_matches('/').to_string(),
            model: args.model,
            concurrency: args.concurrency,
            duration: Duration::from_secs(args.duration),
            max_tokens: args.max_tokens,
            seed: args.seed,
            request_timeout: Duration::from_secs(args.request_timeout),
            health_timeout: Duration::from_secs(args.health_timeout),
            output_path: args.output.as_deref().map(expand_tilde),
            prompts_file: args.prompts_file.as_deref().map(expand_tilde),
            log_level: args.log_level,
            standalone,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid URL: {}", self.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("URL must use http or https: {}", self.base_url);
        }

        if self.model.trim().is_empty() {
            anyhow::bail!("Model name cannot be empty");
        }
        if self.concurrency == 0 {
            anyhow::bail!("Concurrency must be at least 1");
        }
        if self.max_tokens == 0 {
            anyhow::bail!("Max tokens must be at least 1");
        }
        if self.request_timeout.is_zero() {
            anyhow::bail!("Request timeout must be at least 1 second");
        }
        if self.health_timeout.is_zero() {
            anyhow::bail!("Health check timeout must be at least 1 second");
        }

        if let Some(output) = &self.output_path {
            if let Some(parent) = output.parent() {
                if !parent.as_os_str().is_empty() && !parent.is_dir() {
                    anyhow::bail!("Output directory does not exist: {}", parent.display());
                }
            }
        }

        if let Some(prompts) = &self.prompts_file {
            if !prompts.is_file() {
                anyhow::bail!("Prompts file does not exist: {}", prompts.display());
            }
        }

        if let Some(mock) = &self.standalone {
            if !(0.0..=1.0).contains(&mock.error_rate) {
                anyhow::bail!("Mock error rate must be between 0.0 and 1.0");
            }
        }

        Ok(())
    }

    /// Per-request executor parameters
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            request_timeout: self.request_timeout,
        }
    }

    /// Dispatcher parameters
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            executor: self.executor_config(),
            concurrency: self.concurrency,
            duration: self.duration,
            seed: self.seed,
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
