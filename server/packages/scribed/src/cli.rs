use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scribe_invoker::{Invoker, InvokerConfig};

use crate::router::{build_router, AppState};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7420;
const DEFAULT_TOOL: &str = "scribe-tool";
const STATUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "scribed", bin_name = "scribed")]
#[command(about = "Supervised long-form document generation server", version = env!("CARGO_PKG_VERSION"))]
#[command(arg_required_else_help = true)]
pub struct ScribedCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/WebSocket server
    Serve(ServeArgs),
    /// Probe a running server's health endpoint
    Status(ConnectArgs),
    /// Submit a prompt and poll until the document is ready
    Generate(GenerateArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Generation tool binary
    #[arg(long, default_value = DEFAULT_TOOL)]
    tool: PathBuf,

    /// Extra argument passed to the tool (repeatable); the prompt itself is
    /// always delivered over stdin
    #[arg(long = "tool-arg")]
    tool_args: Vec<String>,

    /// Per-attempt timeout in seconds
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    /// Additional attempts after the first
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// Base retry delay in milliseconds (scaled linearly by attempt)
    #[arg(long, default_value_t = 2000)]
    retry_base_delay_ms: u64,

    /// Output byte ceiling per invocation
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    max_output_bytes: usize,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Prompt text
    prompt: String,

    #[command(flatten)]
    connect: ConnectArgs,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 600)]
    wait_secs: u64,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("{0}")]
    Client(String),
}

pub fn run_scribed() -> Result<(), CliError> {
    let cli = ScribedCli::parse();
    init_logging();

    match cli.command {
        Command::Serve(args) => run_server(&args),
        Command::Status(args) => run_status(&args),
        Command::Generate(args) => run_generate(&args),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(args: &ServeArgs) -> Result<(), CliError> {
    let mut tool_args = args.tool_args.clone();
    if tool_args.is_empty() {
        tool_args.push("-p".to_string());
    }

    let invoker = Invoker::new(InvokerConfig {
        program: args.tool.clone(),
        args: tool_args,
        env: HashMap::new(),
        timeout: Duration::from_secs(args.timeout_secs),
        max_retries: args.max_retries,
        retry_base_delay: Duration::from_millis(args.retry_base_delay_ms),
        max_output_bytes: args.max_output_bytes,
        ..InvokerConfig::default()
    });

    let state = AppState::new(invoker);
    let router = build_router(state.clone()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let addr = format!("{}:{}", args.host, args.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        let shutdown_state = state.clone();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            shutdown_state.shutdown().await;
        })
        .await
        .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_status(args: &ConnectArgs) -> Result<(), CliError> {
    let client = HttpClient::builder()
        .timeout(STATUS_REQUEST_TIMEOUT)
        .build()?;
    let url = format!("http://{}:{}/v1/health", args.host, args.port);
    let response = client.get(&url).send()?;
    if !response.status().is_success() {
        return Err(CliError::Client(format!(
            "health check returned {}",
            response.status()
        )));
    }
    let body: Value = response.json()?;
    println!(
        "scribed {} at {}:{} is healthy",
        body["version"].as_str().unwrap_or("unknown"),
        args.host,
        args.port
    );
    Ok(())
}

fn run_generate(args: &GenerateArgs) -> Result<(), CliError> {
    let client = HttpClient::new();
    let base = format!("http://{}:{}/v1", args.connect.host, args.connect.port);

    let response = client
        .post(format!("{base}/documents"))
        .json(&json!({ "prompt": args.prompt }))
        .send()?;
    if !response.status().is_success() {
        let body: Value = response.json().unwrap_or_default();
        return Err(CliError::Client(format!(
            "submission rejected: {}",
            body["detail"].as_str().unwrap_or("unknown error")
        )));
    }
    let body: Value = response.json()?;
    let job_id = body["jobId"]
        .as_str()
        .ok_or_else(|| CliError::Client("response missing jobId".to_string()))?
        .to_string();
    tracing::info!(job_id = %job_id, "generation submitted");

    let deadline = std::time::Instant::now() + Duration::from_secs(args.wait_secs);
    loop {
        if std::time::Instant::now() > deadline {
            return Err(CliError::Client(format!(
                "job {job_id} did not finish within {}s",
                args.wait_secs
            )));
        }
        std::thread::sleep(Duration::from_millis(args.poll_ms));

        let record: Value = client
            .get(format!("{base}/documents/{job_id}"))
            .send()?
            .json()?;
        match record["status"].as_str() {
            Some("completed") => {
                println!("{}", record["output"].as_str().unwrap_or(""));
                return Ok(());
            }
            Some("failed") => {
                return Err(CliError::Client(format!(
                    "generation failed: {}",
                    record["error"].as_str().unwrap_or("unknown error")
                )));
            }
            _ => {}
        }
    }
}
