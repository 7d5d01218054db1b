#![forbid(unsafe_code)]

//! `agent-conduit`: drive an agent subprocess from the command line.
//!
//! `exec` runs one Dialect A turn; `run` performs the Dialect B handshake,
//! starts or resumes a thread and runs one turn. Agent events are printed
//! to stdout as JSON lines.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::approval::{ApprovalNegotiator, Decision};
use agent_conduit::audit::{AuditLogger, JsonlAuditWriter, TracingAuditLogger};
use agent_conduit::dialect::Dialect;
use agent_conduit::events::Event;
use agent_conduit::retry::with_retry;
use agent_conduit::rpc::handshake::{initialize, ClientInfo};
use agent_conduit::rpc::thread::{resume_thread, text_input};
use agent_conduit::rpc::Connection;
use agent_conduit::transcript::TranscriptWriter;
use agent_conduit::transport::{ProcessHandle, StopMode, Transport};
use agent_conduit::turn::{exec_turn, TurnEvent, TurnOrchestrator, TurnStream};
use agent_conduit::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conduit", about = "Drive an AI agent subprocess", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Write every agent event to this JSONL transcript.
    #[arg(long)]
    record: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one turn over the one-directional event stream.
    Exec {
        /// Prompt text.
        prompt: String,
    },
    /// Run one turn over the JSON-RPC protocol.
    Run {
        /// Prompt text.
        prompt: String,
        /// Resume this thread instead of starting a new one.
        #[arg(long)]
        thread: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(command = %config.agent.command, "configuration loaded");

    let mut recorder = args.record.map(TranscriptWriter::create).transpose()?;

    match args.command {
        Command::Exec { prompt } => run_exec(&config, prompt, recorder.as_mut()).await,
        Command::Run { prompt, thread } => {
            run_session(&config, prompt, thread, recorder.as_mut()).await
        }
    }
}

async fn run_exec(
    config: &GlobalConfig,
    prompt: String,
    recorder: Option<&mut TranscriptWriter>,
) -> Result<()> {
    let launch = Dialect::Exec.launch_args().iter().map(|s| (*s).to_owned());
    let spec = config.process_spec(launch.chain([prompt]));
    let handle = ProcessHandle::start(&spec, config.transport_options())?;
    info!(pid = handle.pid().unwrap_or_default(), "agent started");

    let stream = exec_turn(&handle, config.turn_timeout()).await?;
    let result = pump(stream, recorder).await;

    let status = handle.stop(StopMode::Graceful).await;
    info!(exit = ?status.exit, "agent stopped");
    result
}

async fn run_session(
    config: &GlobalConfig,
    prompt: String,
    thread: Option<String>,
    recorder: Option<&mut TranscriptWriter>,
) -> Result<()> {
    let launch = Dialect::AppServer.launch_args().iter().map(|s| (*s).to_owned());
    let transport = Transport::new(config.process_spec(launch), config.transport_options());
    let handle = transport.handle().await?;
    let conn = Connection::open(handle, config.connection_options()).await?;

    let client = ClientInfo {
        name: config.protocol.client_name.clone(),
        title: config.protocol.client_title.clone(),
        ..ClientInfo::default()
    };
    initialize(&conn, &client, None).await?;

    let audit: Arc<dyn AuditLogger> = match &config.audit.log_dir {
        Some(dir) => Arc::new(JsonlAuditWriter::new(dir.clone())?),
        None => Arc::new(TracingAuditLogger),
    };
    let negotiator = ApprovalNegotiator::with_audit(
        Arc::new(config.approval_policy()?),
        audit,
        config.approval_timeout(),
    );
    let prompter = tokio::spawn(prompt_for_approvals(negotiator.clone()));
    let orchestrator = TurnOrchestrator::new(conn.clone(), negotiator, config.turn_timeout());

    let retry = config.retry_options();
    let rate_limit = config.rate_limit_options();

    let thread_id = match thread {
        Some(id) => resume_thread(&conn, &id).await?,
        None => {
            with_retry(
                || orchestrator.start_thread(json!({})),
                &retry,
                &rate_limit,
            )
            .await?
        }
    };
    info!(%thread_id, "thread ready");

    let stream = with_retry(
        || {
            let orchestrator = orchestrator.clone();
            let thread_id = thread_id.clone();
            let input = text_input(&prompt);
            async move { orchestrator.run_turn(&thread_id, input, None).await }
        },
        &retry,
        &rate_limit,
    )
    .await?;
    let result = pump(stream, recorder).await;

    prompter.abort();
    if let Some(status) = transport.stop(StopMode::Graceful).await {
        info!(exit = ?status.exit, "agent stopped");
    }
    result
}

/// Print events until the turn ends. Ctrl-C cancels the turn.
async fn pump(mut stream: TurnStream, mut recorder: Option<&mut TranscriptWriter>) -> Result<()> {
    let handle = stream.handle();
    let shutdown = tokio::spawn(async move {
        shutdown_signal().await;
        warn!("interrupt received, cancelling turn");
        handle.cancel();
    });

    let mut outcome = Err(AppError::TransportClosed("turn stream ended".into()));
    while let Some(item) = stream.next().await {
        match item {
            TurnEvent::Event(event) => {
                print_event(&event, recorder.as_deref_mut());
                match &event {
                    Event::TurnCompleted { .. } => outcome = Ok(()),
                    Event::TurnFailed { message, .. } => {
                        outcome = Err(AppError::Protocol(format!("turn failed: {message}")));
                    }
                    _ => {}
                }
            }
            TurnEvent::UserInput(request) => {
                warn!(request_id = %request.id, "agent asked for input; skipping");
                if let Err(err) = request.skip().await {
                    warn!(%err, "user input reply failed");
                }
            }
            TurnEvent::ApprovalResolved {
                request,
                disposition,
            } => match disposition.into_decision() {
                Ok(decision) => {
                    info!(
                        request_id = %request.id,
                        decision = decision.label(),
                        "approval resolved"
                    );
                }
                Err(err) => warn!(request_id = %request.id, %err, "approval declined"),
            },
            TurnEvent::TimedOut => outcome = Err(AppError::Timeout("turn timed out".into())),
            TurnEvent::Cancelled => outcome = Err(AppError::Cancelled("turn cancelled".into())),
            TurnEvent::Failed { error } => outcome = Err(AppError::TransportClosed(error)),
        }
    }

    shutdown.abort();
    outcome
}

fn print_event(event: &Event, recorder: Option<&mut TranscriptWriter>) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => error!(%err, "event not serializable"),
    }
    if let Some(recorder) = recorder {
        if let Err(err) = recorder.append(event) {
            error!(%err, path = %recorder.path().display(), "transcript write failed");
        }
    }
}

/// Ask on stderr / stdin for every deferred approval.
async fn prompt_for_approvals(negotiator: ApprovalNegotiator) {
    let mut requests = negotiator.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(request) = requests.recv().await {
        let subject = request
            .command
            .clone()
            .unwrap_or_else(|| request.paths.join(", "));
        eprintln!(
            "approve {:?} {subject}? [y]es / [a]lways / [N]o / [x] abort",
            request.kind
        );
        let answer = match stdin.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                warn!(%err, "stdin read failed");
                return;
            }
        };
        let decision = match answer.trim() {
            "y" | "yes" => Decision::AcceptOnce,
            "a" | "always" => Decision::AcceptForSession,
            "x" | "abort" => Decision::Abort,
            _ => Decision::decline("declined at prompt"),
        };
        if let Err(err) = negotiator.reply(&request.id, decision) {
            warn!(%err, "approval reply rejected");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stdout carries events; logs go to stderr.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
