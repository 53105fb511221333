//! Worklet Server
//!
//! Entry point for the worklet pipeline. `serve` exposes an HTTP trigger and
//! a websocket bridged to the in-process topic hub; `run` drives one
//! workflow from the terminal; `iterate` revises a worklet file it wrote.

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashSet,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::broadcast::error::RecvError,
};
use tracing_subscriber::EnvFilter;
use worklet_core::approval::{ApprovalBroker, ApprovalKind};
use worklet_core::config::PipelineConfig;
use worklet_core::llm::{Cl100kTokenizer, OllamaTransport};
use worklet_core::pipeline::{
    enhance_worklet, iterate_field, InputDocument, PipelineExecutor, PipelineState, StageContext,
    Worklet, WorkletField, WorkletVersions,
};
use worklet_core::pubsub::{split_topic, TopicEvent, TopicHub, STATUS_UPDATE};
use worklet_core::tools::{GithubReferences, JsonArtifactSink, ReferenceFinder, TavilyClient};

/// Timeout for one model request
const MODEL_TIMEOUT: Duration = Duration::from_secs(600);

/// Application state
struct AppState {
    ctx: Arc<StageContext>,
    hub: TopicHub,
    /// Threads with a workflow in progress
    running: Mutex<HashSet<String>>,
}

type SharedState = Arc<AppState>;

// === API Types ===

#[derive(Deserialize)]
struct StartThreadRequest {
    thread_id: Option<String>,
    #[serde(default = "default_count")]
    count: usize,
    custom_prompt: Option<String>,
    #[serde(default)]
    links: Vec<String>,
    cluster_name: Option<String>,
    /// Documents whose text was already extracted
    #[serde(default)]
    documents: Vec<InputDocument>,
}

fn default_count() -> usize {
    3
}

#[derive(Serialize)]
struct StartThreadResponse {
    thread_id: String,
}

#[derive(Serialize)]
struct ApiError {
    message: String,
}

#[derive(Parser, Clone)]
#[command(author, version, about = "Worklet - project idea generation pipeline")]
struct Args {
    /// JSON config file (defaults, then WORKLET_* overrides)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start the Worklet server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Run one workflow in the terminal (no server)
    Run {
        /// Free-text instruction
        #[arg(short, long)]
        prompt: Option<String>,
        /// Link to extract (repeatable)
        #[arg(short, long)]
        link: Vec<String>,
        /// Plain-text document (repeatable)
        #[arg(short, long)]
        doc: Vec<PathBuf>,
        /// Number of worklets to generate
        #[arg(short, long, default_value = "3")]
        count: usize,
        /// Cluster whose built-in terms are offered for approval
        #[arg(long)]
        cluster: Option<String>,
        /// Approve every request as proposed
        #[arg(long)]
        auto_approve: bool,
    },
    /// Revise a worklet file written by a previous run
    Iterate {
        /// Worklet JSON file
        #[arg(short, long)]
        worklet: PathBuf,
        /// Field to revise; the whole worklet is revised when omitted
        #[arg(short, long)]
        field: Option<String>,
        /// Revision instruction
        #[arg(short, long)]
        prompt: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => {
            let mut config = PipelineConfig::load(path)?;
            config.apply_env_with(|key| std::env::var(key).ok())?;
            Ok(config)
        }
        None => PipelineConfig::from_env(),
    }
}

/// Wire the default adapters around the shared services
fn build_context(config: PipelineConfig, hub: &TopicHub) -> anyhow::Result<StageContext> {
    let transport = OllamaTransport::new(MODEL_TIMEOUT).context("Failed to create model transport")?;
    let tokenizer = Cl100kTokenizer::new().context("Failed to load tokenizer")?;
    let output_dir = config.output_dir.clone();
    let upstream = config.upstream_retry;

    let mut ctx = StageContext::new(
        config,
        Arc::new(transport),
        Arc::new(tokenizer),
        Arc::new(hub.clone()),
    );

    let github = GithubReferences::from_env()
        .context("Failed to create GitHub client")?
        .with_retry(upstream);
    let mut references = ReferenceFinder::new().with_github(Arc::new(github));

    match TavilyClient::from_env() {
        Some(tavily) => {
            let tavily = Arc::new(tavily.with_retry(upstream));
            ctx = ctx.with_search(tavily.clone()).with_links(tavily.clone());
            references = references.with_web_fallback(tavily);
        }
        None => tracing::warn!("TAVILY_API_KEY not set, web search and link extraction disabled"),
    }

    Ok(ctx
        .with_references(references)
        .with_artifacts(Arc::new(JsonArtifactSink::new(output_dir))))
}

// === HTTP ===

async fn start_thread(
    State(state): State<SharedState>,
    Json(req): Json<StartThreadRequest>,
) -> Result<(StatusCode, Json<StartThreadResponse>), (StatusCode, Json<ApiError>)> {
    let thread_id = req
        .thread_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    {
        let mut running = state.running.lock().map_err(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError {
                    message: "Thread registry poisoned".into(),
                }),
            )
        })?;
        if !running.insert(thread_id.clone()) {
            return Err((
                StatusCode::CONFLICT,
                Json(ApiError {
                    message: format!("Thread {} is already running", thread_id),
                }),
            ));
        }
    }

    let mut pipeline_state = PipelineState::new(&thread_id, req.count)
        .with_documents(req.documents)
        .with_links(req.links);
    if let Some(prompt) = req.custom_prompt {
        pipeline_state = pipeline_state.with_custom_prompt(prompt);
    }
    if let Some(cluster) = req.cluster_name {
        pipeline_state = pipeline_state.with_cluster(cluster);
    }

    let executor = PipelineExecutor::new(state.ctx.clone());
    let app = state.clone();
    let id = thread_id.clone();
    tokio::spawn(async move {
        match executor.run(pipeline_state).await {
            Ok(done) => tracing::info!(
                session = %done.session_key,
                worklets = done.worklets.len(),
                "Thread finished"
            ),
            Err(e) => tracing::error!("Thread {} failed: {:#}", id, e),
        }
        if let Ok(mut running) = app.running.lock() {
            running.remove(&id);
        }
    });

    Ok((StatusCode::ACCEPTED, Json(StartThreadResponse { thread_id })))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Forward hub events to the client; route client frames to the approval broker
async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.hub.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Websocket client lagging, events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let approvals = state.ctx.approvals.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<TopicEvent>(&text) {
                    Ok(event) => {
                        if !approvals.deliver(&event.topic, event.payload) {
                            tracing::debug!(topic = %event.topic, "Inbound frame matched no approval");
                        }
                    }
                    Err(e) => tracing::warn!("Invalid websocket frame: {}", e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

/// Resolve on Ctrl+C; waiting model calls fail instead of holding shutdown
async fn shutdown_signal(ctx: Arc<StageContext>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
    ctx.invoker.throttles().close();
}

async fn run_server(ctx: Arc<StageContext>, hub: TopicHub, port: u16) -> anyhow::Result<()> {
    let shutdown = shutdown_signal(ctx.clone());
    let state = Arc::new(AppState {
        ctx,
        hub,
        running: Mutex::new(HashSet::new()),
    });

    let app = Router::new()
        .route("/api/v1/threads", post(start_thread))
        .route("/api/v1/ws", get(ws_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Worklet server running at http://{}", addr);
    tracing::info!("  Threads:   POST /api/v1/threads");
    tracing::info!("  Events:    /api/v1/ws (WebSocket)");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

// === Terminal ===

/// Print status updates and answer approval requests from the terminal
fn spawn_terminal_approver(hub: &TopicHub, broker: Arc<ApprovalBroker>, auto_approve: bool) {
    let mut events = hub.subscribe();
    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let mut last_status = String::new();

        loop {
            let TopicEvent { topic, payload } = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            let Some((session, name)) = split_topic(&topic) else {
                continue;
            };

            if name == STATUS_UPDATE {
                let message = payload["message"].as_str().unwrap_or_default();
                if message != last_status {
                    println!("» {}", message);
                    last_status = message.to_string();
                }
                continue;
            }

            let Some(kind) = ApprovalKind::from_request_suffix(name) else {
                continue;
            };
            let response_topic = format!("{}/{}", session, kind.response_suffix());

            let response = if auto_approve {
                payload
            } else {
                println!(
                    "\nApproval requested ({}):\n{}",
                    name,
                    serde_json::to_string_pretty(&payload).unwrap_or_default()
                );
                println!("Press Enter to approve as shown, or paste a JSON response:");
                match stdin.next_line().await {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        serde_json::from_str::<Value>(&line).unwrap_or_else(|e| {
                            println!("Not valid JSON ({}), approving as shown", e);
                            payload
                        })
                    }
                    _ => payload,
                }
            };
            broker.deliver(&response_topic, response);
        }
    });
}

async fn run_once(
    ctx: Arc<StageContext>,
    hub: TopicHub,
    state: PipelineState,
    auto_approve: bool,
) -> anyhow::Result<()> {
    spawn_terminal_approver(&hub, ctx.approvals.clone(), auto_approve);

    let output_dir = ctx.config.output_dir.clone();
    let session = state.session_key.clone();
    let done = PipelineExecutor::new(ctx).run(state).await?;

    println!("\nGenerated {} worklets:", done.worklets.len());
    for (idx, worklet) in done.worklets.iter().enumerate() {
        println!(
            "  {}. {} ({} references)",
            idx + 1,
            worklet.title(),
            worklet.references.len()
        );
    }
    println!("Files written to {}", output_dir.join(&session).display());
    Ok(())
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Revise a worklet file; its history is kept next to it as `*.versions.json`
async fn iterate_once(
    ctx: Arc<StageContext>,
    path: PathBuf,
    field: Option<String>,
    prompt: String,
) -> anyhow::Result<()> {
    let history_path = path.with_extension("versions.json");

    let mut versions = if tokio::fs::try_exists(&history_path).await? {
        let raw = tokio::fs::read_to_string(&history_path).await?;
        serde_json::from_str::<WorkletVersions>(&raw)
            .with_context(|| format!("Invalid worklet history: {}", history_path.display()))?
    } else {
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read worklet: {}", path.display()))?;
        let worklet: Worklet = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid worklet file: {}", path.display()))?;
        WorkletVersions::new(&worklet)
    };

    let base = versions
        .selected()
        .map(|version| version.version_id)
        .context("Worklet history has no selected version")?;

    match field {
        Some(name) => {
            let field = WorkletField::from_name(&name)
                .with_context(|| format!("Unknown worklet field '{}'", name))?;
            iterate_field(&ctx, &mut versions, base, field, &prompt).await?;
        }
        None => {
            enhance_worklet(&ctx, &mut versions, base, &prompt).await?;
        }
    }

    let current = versions
        .current()
        .context("Worklet history has no selected version")?;
    write_json(&path, &current).await?;
    write_json(&history_path, &versions).await?;

    println!(
        "Version {} of '{}' written to {}",
        versions.selected_index() + 1,
        current.title(),
        path.display()
    );
    Ok(())
}

async fn read_documents(paths: &[PathBuf]) -> anyhow::Result<Vec<InputDocument>> {
    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read document: {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        documents.push(InputDocument::new(file_name, text));
    }
    Ok(documents)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,worklet_core=debug")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    let hub = TopicHub::default();
    let ctx = Arc::new(build_context(config, &hub)?);

    match args.command.unwrap_or(CliCommand::Serve { port: 8080 }) {
        CliCommand::Serve { port } => run_server(ctx, hub, port).await,
        CliCommand::Run {
            prompt,
            link,
            doc,
            count,
            cluster,
            auto_approve,
        } => {
            let mut state = PipelineState::new(uuid::Uuid::new_v4().to_string(), count)
                .with_documents(read_documents(&doc).await?)
                .with_links(link);
            if let Some(prompt) = prompt {
                state = state.with_custom_prompt(prompt);
            }
            if let Some(cluster) = cluster {
                state = state.with_cluster(cluster);
            }
            run_once(ctx, hub, state, auto_approve).await
        }
        CliCommand::Iterate {
            worklet,
            field,
            prompt,
        } => iterate_once(ctx, worklet, field, prompt).await,
    }
}
