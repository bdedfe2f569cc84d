use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use futures::StreamExt;
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::client::{CompletionClient, Nothing};
use rig::providers::{anthropic, ollama, openai};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::{error, info, warn};

use steward_channels::{TelegramChannel, TelegramTransport};
use steward_config::{
    find_config_path, load_config, resolve_path, save_config, BackendKind, Config, GatePolicy,
};
use steward_core::backend::{ClaudeCliBackend, RigBackend, TranscriptStore};
use steward_core::identity::IdentityDirectory;
use steward_core::session::TokenStore;
use steward_core::store::NewTask;
use steward_core::task::TaskKind;
use steward_core::transport::send_to_user;
use steward_core::{
    build_gate, AgentBackend, HeartbeatRunner, HeartbeatSettings, RecipientGate, SchedulerRunner,
    SessionManager, SessionSettings, Store, StreamItem, TaskStatus, Transport, TriggerEvent,
    TriggerExecutor,
};

/// Render markdown text to the terminal using termimad.
fn render_markdown(text: &str) {
    let skin = termimad::MadSkin::default();
    skin.print_text(text);
}

#[derive(Parser)]
#[command(name = "steward", about = "Personal assistant bot for a single owner", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Telegram bot with the heartbeat and task scheduler
    Serve,
    /// Chat with the assistant as the owner
    Chat,
    /// Send one message as the owner and print the reply
    Ask {
        /// Message text
        message: String,
    },
    /// Run a one-off background trigger and deliver the result to the owner
    Trigger {
        /// Prompt for the background session
        prompt: String,
        /// Name used in logs
        #[arg(long, default_value = "cli")]
        source: String,
        /// Prepended to the delivered result
        #[arg(long)]
        prefix: Option<String>,
        /// Reply text that suppresses delivery
        #[arg(long)]
        marker: Option<String>,
        /// Sent to the owner before the work starts
        #[arg(long)]
        preview: Option<String>,
        /// Print the result instead of messaging the owner
        #[arg(long)]
        quiet: bool,
    },
    /// Run a single heartbeat check now
    Heartbeat,
    /// Message a contact, subject to the recipient gate
    Send {
        /// Recipient Telegram id
        id: i64,
        /// Message text
        message: String,
    },
    /// Forget conversation state
    Reset {
        /// Recipient id to reset
        #[arg(long, conflicts_with = "all")]
        id: Option<i64>,
        /// Reset every recipient
        #[arg(long)]
        all: bool,
    },
    /// Manage external contacts
    Users {
        #[command(subcommand)]
        action: UserCommands,
    },
    /// Inspect and add tasks
    Tasks {
        #[command(subcommand)]
        action: TaskCommands,
    },
    /// Show configuration and state summary
    Status,
    /// Create a config file and workspace
    Onboard {
        /// Skip interactive prompts and write defaults
        #[arg(long)]
        non_interactive: bool,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// List known contacts
    List,
    /// Allow messages to a user
    Whitelist { id: i64 },
    /// Revoke a whitelist grant
    Unwhitelist { id: i64 },
    /// Block a user under every policy
    Ban { id: i64 },
    /// Lift a ban
    Unban { id: i64 },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List open tasks
    List,
    /// Add a task
    Add {
        /// Task title
        title: String,
        /// Assignee Telegram id
        #[arg(long)]
        assignee: Option<i64>,
        /// Deadline (RFC 3339, "YYYY-MM-DD HH:MM" or "YYYY-MM-DD")
        #[arg(long)]
        deadline: Option<String>,
        /// Make it a scheduled job running at this time
        #[arg(long)]
        at: Option<String>,
        /// Repeat interval in seconds for scheduled jobs
        #[arg(long, requires = "at")]
        every: Option<i64>,
    },
    /// Mark a task done
    Done { id: String },
    /// Cancel a task
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},steward_core=debug");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(find_config_path);
    let load = || load_config(&config_path);

    match cli.command {
        Commands::Onboard { non_interactive } => run_onboard(cli.config, non_interactive),
        Commands::Status => run_status(&config_path),
        Commands::Serve => run_serve(&load()?).await,
        Commands::Chat => {
            let sessions = build_sessions(&load()?)?;
            run_chat(&sessions).await
        }
        Commands::Ask { message } => {
            let sessions = build_sessions(&load()?)?;
            let reply = sessions.get_owner_session().query(&message).await;
            render_markdown(&reply);
            Ok(())
        }
        Commands::Trigger {
            prompt,
            source,
            prefix,
            marker,
            preview,
            quiet,
        } => {
            let mut event = TriggerEvent::new(source, prompt);
            if let Some(prefix) = prefix {
                event = event.with_prefix(prefix);
            }
            if let Some(marker) = marker {
                event = event.silent_when(marker);
            }
            if let Some(preview) = preview {
                event = event.with_preview(preview);
            }
            if quiet {
                event = event.quiet();
            }
            run_trigger(&load()?, event).await
        }
        Commands::Heartbeat => run_heartbeat_once(&load()?).await,
        Commands::Send { id, message } => run_send(&load()?, id, &message).await,
        Commands::Reset { id, all } => {
            let sessions = build_sessions(&load()?)?;
            match (id, all) {
                (_, true) => {
                    sessions.reset_all().await;
                    println!("All sessions reset.");
                }
                (Some(id), false) => {
                    sessions.reset_session(id).await;
                    println!("Session {id} reset.");
                }
                (None, false) => {
                    sessions.reset_session(sessions.owner_id()).await;
                    println!("Owner session reset.");
                }
            }
            Ok(())
        }
        Commands::Users { action } => run_user_command(action, &load()?).await,
        Commands::Tasks { action } => run_task_command(action, &load()?),
    }
}

/// Resolve an API key from config, falling back to an environment variable.
fn resolve_api_key(
    provider_cfg: &Option<steward_config::ProviderConfig>,
    env_var: &str,
) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_key.clone())
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.is_empty()))
}

/// Create a completion model for a specific provider + model combination.
#[allow(deprecated)]
fn create_model_for(
    provider: &str,
    model_name: &str,
    config: &Config,
) -> Result<CompletionModelHandle<'static>> {
    if model_name.is_empty() {
        anyhow::bail!("No model configured for provider '{provider}'.");
    }

    match provider {
        "anthropic" => {
            let key = resolve_api_key(&config.providers.anthropic, "ANTHROPIC_API_KEY")
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Anthropic provider selected but no API key found. \
                     Set providers.anthropic.apiKey in config.json or ANTHROPIC_API_KEY env var."
                    )
                })?;
            let client: anthropic::Client = anthropic::Client::builder()
                .api_key(&key)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Anthropic client: {e}"))?;
            let model = client.completion_model(model_name).with_prompt_caching();
            info!("Using Anthropic provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "openai" => {
            let key =
                resolve_api_key(&config.providers.openai, "OPENAI_API_KEY").ok_or_else(|| {
                    anyhow::anyhow!(
                        "OpenAI provider selected but no API key found. \
                     Set providers.openai.apiKey in config.json or OPENAI_API_KEY env var."
                    )
                })?;
            let mut builder = openai::CompletionsClient::builder().api_key(&key);
            if let Some(ref base) = config
                .providers
                .openai
                .as_ref()
                .and_then(|c| c.api_base.clone())
                .filter(|b| !b.is_empty())
            {
                builder = builder.base_url(base);
            }
            let client: openai::CompletionsClient = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
            let model = client.completion_model(model_name);
            info!("Using OpenAI provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "ollama" => {
            let mut builder = ollama::Client::builder().api_key(Nothing);
            if let Some(ref base) = config
                .providers
                .ollama
                .as_ref()
                .and_then(|c| c.api_base.clone())
                .filter(|b| !b.is_empty())
            {
                builder = builder.base_url(base);
            }
            let client: ollama::Client = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Ollama client: {e}"))?;
            let model = client.completion_model(model_name);
            info!("Using Ollama provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        other => anyhow::bail!(
            "Unknown provider '{other}'. Valid providers: anthropic, openai, ollama"
        ),
    }
}

fn create_backend(config: &Config, settings: &SessionSettings) -> Result<Arc<dyn AgentBackend>> {
    match config.agent.backend {
        BackendKind::ClaudeCli => {
            let backend = ClaudeCliBackend::new(&config.agent.claude)?;
            info!("Using Claude CLI backend");
            Ok(Arc::new(backend))
        }
        BackendKind::Rig => {
            let model_ref = &config.agent.model;
            let model = create_model_for(&model_ref.provider, &model_ref.model, config)?;
            let transcripts = TranscriptStore::new(settings.sessions_dir.join("transcripts"));
            Ok(Arc::new(RigBackend::new(
                model,
                model_ref.model.clone(),
                transcripts,
                config.agent.max_tokens,
                config.agent.temperature,
            )))
        }
    }
}

fn build_sessions(config: &Config) -> Result<Arc<SessionManager>> {
    let settings = SessionSettings::from_config(config)?;
    std::fs::create_dir_all(&settings.workspace).with_context(|| {
        format!(
            "failed to create workspace '{}'",
            settings.workspace.display()
        )
    })?;
    let backend = create_backend(config, &settings)?;
    Ok(Arc::new(SessionManager::new(settings, backend)))
}

fn open_store(config: &Config) -> Result<Arc<Store>> {
    Ok(Arc::new(Store::open(&resolve_path(&config.store.path))?))
}

fn build_recipient_gate(config: &Config, store: &Arc<Store>) -> Result<Arc<dyn RecipientGate>> {
    let policy = config
        .gate
        .policy
        .ok_or_else(|| anyhow::anyhow!("gate.policy is not configured"))?;
    Ok(build_gate(policy, config.owner_id()?, store.clone()))
}

/// Prints outbound messages; used when no bot token is configured.
struct ConsoleTransport;

#[async_trait]
impl Transport for ConsoleTransport {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, recipient_id: i64, text: &str) -> Result<()> {
        println!("→ {recipient_id}");
        render_markdown(text);
        println!();
        Ok(())
    }
}

fn outbound_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    if config.telegram.token.is_empty() {
        warn!("No Telegram token configured, printing messages instead");
        return Ok(Arc::new(ConsoleTransport));
    }
    Ok(Arc::new(TelegramTransport::new(
        &config.telegram,
        config.delivery.max_message_length,
    )?))
}

async fn run_serve(config: &Config) -> Result<()> {
    config.validate()?;
    let sessions = build_sessions(config)?;
    let store = open_store(config)?;
    let gate = build_recipient_gate(config, &store)?;
    let max_length = config.delivery.max_message_length;
    let transport = Arc::new(TelegramTransport::new(&config.telegram, max_length)?);

    let heartbeat = match HeartbeatSettings::from_config(config) {
        Some(settings) => {
            let runner = HeartbeatRunner::new(
                sessions.clone(),
                store.clone(),
                gate.clone(),
                transport.clone(),
                settings,
            );
            runner.start();
            Some(runner)
        }
        None => {
            info!("Heartbeat disabled (interval=0)");
            None
        }
    };

    let scheduler = match SchedulerRunner::poll_from_config(config) {
        Some(poll) => {
            let executor = Arc::new(TriggerExecutor::new(
                sessions.clone(),
                transport.clone(),
                max_length,
                config.triggers.silent_marker.clone(),
            ));
            let runner = SchedulerRunner::new(store.clone(), executor, poll);
            runner.start();
            Some(runner)
        }
        None => {
            info!("Scheduler disabled (schedulerPollSecs=0)");
            None
        }
    };

    let channel = Arc::new(TelegramChannel::new(
        transport.bot(),
        sessions.clone(),
        gate,
        store,
        max_length,
    ));
    let polling = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.run().await })
    };

    info!(
        "Steward is running for owner {}. Press Ctrl-C to stop.",
        sessions.owner_id()
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(runner) = &scheduler {
        runner.stop().await;
    }
    if let Some(runner) = &heartbeat {
        runner.stop().await;
    }
    channel.stop().await;
    match tokio::time::timeout(Duration::from_secs(10), polling).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Telegram channel failed: {e:#}"),
        Ok(Err(e)) => error!("Telegram channel task failed: {e}"),
        Err(_) => warn!("Telegram channel did not stop in time"),
    }
    Ok(())
}

async fn run_trigger(config: &Config, event: TriggerEvent) -> Result<()> {
    let sessions = build_sessions(config)?;
    let transport = outbound_transport(config)?;
    let executor = TriggerExecutor::new(
        sessions,
        transport,
        config.delivery.max_message_length,
        config.triggers.silent_marker.clone(),
    );
    match executor.execute(&event).await? {
        Some(text) if !event.notify_owner => render_markdown(&text),
        Some(_) => println!("Result delivered to the owner."),
        None => println!("Nothing to report."),
    }
    Ok(())
}

async fn run_send(config: &Config, id: i64, message: &str) -> Result<()> {
    config.validate()?;
    let store = open_store(config)?;
    let gate = build_recipient_gate(config, &store)?;
    let transport = outbound_transport(config)?;
    let decision = send_to_user(gate.as_ref(), transport.as_ref(), id, message).await?;
    if decision.allowed {
        println!("Sent to {id} ({}).", decision.reason);
    } else {
        println!("Not sent to {id}: {}.", decision.reason);
    }
    Ok(())
}

async fn run_heartbeat_once(config: &Config) -> Result<()> {
    config.validate()?;
    let sessions = build_sessions(config)?;
    let store = open_store(config)?;
    let gate = build_recipient_gate(config, &store)?;
    let transport = outbound_transport(config)?;
    let settings = HeartbeatSettings::from_config(config).unwrap_or_else(|| HeartbeatSettings {
        interval: Duration::from_secs(30 * 60),
        silent_marker: config.heartbeat.silent_marker.clone(),
        max_length: config.delivery.max_message_length,
    });

    let runner = HeartbeatRunner::new(sessions, store, gate, transport, settings);
    let report = runner.trigger_now().await;
    println!(
        "Reminders: {} sent, {} denied, {} failed",
        report.reminders_sent, report.reminders_denied, report.reminders_failed
    );
    match report.briefing {
        Some(_) => println!("Briefing delivered to the owner."),
        None => println!("No briefing (nothing to report)."),
    }
    Ok(())
}

async fn run_chat(sessions: &SessionManager) -> Result<()> {
    let history_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".steward")
        .join("history");
    std::fs::create_dir_all(&history_dir)?;
    let history_path = history_dir.join("cli_history");

    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    println!("steward chat (type /help for commands, Ctrl-D to quit)");
    println!();

    let result = loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                match input {
                    "exit" | "quit" | "/exit" | "/quit" => break Ok(()),
                    "/help" => {
                        println!("Commands:");
                        println!("  /new   - Start a new conversation");
                        println!("  /help  - Show this help");
                        println!("  /quit  - Exit");
                        println!();
                        continue;
                    }
                    "/new" => {
                        sessions.reset_session(sessions.owner_id()).await;
                        println!("New session started.");
                        println!();
                        continue;
                    }
                    _ => {}
                }

                let session = sessions.get_owner_session();
                let mut stream = session.query_stream(input);
                while let Some(item) = stream.next().await {
                    match item {
                        StreamItem::Tool(name) => println!("  ⚙ {name}"),
                        StreamItem::Text(_) => {}
                        StreamItem::Final(reply) => {
                            println!();
                            render_markdown(&reply);
                            println!();
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break Ok(());
            }
            Err(err) => {
                eprintln!("Error: {err}");
                break Ok(());
            }
        }
    };

    let _ = rl.save_history(&history_path);
    result
}

async fn run_user_command(action: UserCommands, config: &Config) -> Result<()> {
    let store = open_store(config)?;
    match action {
        UserCommands::List => {
            let users = store.list_users().await?;
            if users.is_empty() {
                println!("No contacts yet.");
                return Ok(());
            }
            println!("{:<14} {:<28} {:<6} {:<6} LAST CONTACT", "ID", "NAME", "WL", "BAN");
            for user in users {
                println!(
                    "{:<14} {:<28} {:<6} {:<6} {}",
                    user.telegram_id,
                    user.display_name(),
                    if user.is_whitelisted { "yes" } else { "-" },
                    if user.is_banned { "yes" } else { "-" },
                    user.last_contact
                        .with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M")
                );
            }
        }
        UserCommands::Whitelist { id } => {
            store.set_whitelisted(id, true).await?;
            println!("User {id} whitelisted.");
        }
        UserCommands::Unwhitelist { id } => {
            store.set_whitelisted(id, false).await?;
            println!("User {id} removed from whitelist.");
        }
        UserCommands::Ban { id } => {
            store.set_banned(id, true).await?;
            println!("User {id} banned.");
        }
        UserCommands::Unban { id } => {
            store.set_banned(id, false).await?;
            println!("User {id} unbanned.");
        }
    }
    Ok(())
}

/// Parse a CLI time: RFC 3339, or local "YYYY-MM-DD HH:MM", or a local date
/// meaning the end of that day.
fn parse_when(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(23, 59, 0))
        })
        .ok_or_else(|| anyhow::anyhow!("invalid time '{raw}'"))?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow::anyhow!("ambiguous local time '{raw}'"))
}

fn run_task_command(action: TaskCommands, config: &Config) -> Result<()> {
    let store = open_store(config)?;
    match action {
        TaskCommands::List => {
            let tasks = store.open_tasks()?;
            if tasks.is_empty() {
                println!("No open tasks.");
                return Ok(());
            }
            let now = Utc::now();
            for task in tasks {
                let when = task
                    .deadline
                    .or(task.schedule_at)
                    .map(|d| d.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".into());
                let flag = if task.is_overdue(now) { " (overdue)" } else { "" };
                println!(
                    "[{}] {:<11} {:<20} {when}{flag}  {}",
                    task.id,
                    task.status.as_str(),
                    task.assignee_name.as_deref().unwrap_or("-"),
                    task.title
                );
            }
        }
        TaskCommands::Add {
            title,
            assignee,
            deadline,
            at,
            every,
        } => {
            let deadline = deadline.as_deref().map(parse_when).transpose()?;
            let schedule_at = at.as_deref().map(parse_when).transpose()?;
            let kind = if schedule_at.is_some() {
                TaskKind::Scheduled
            } else {
                TaskKind::Task
            };
            let id = store.insert_task(&NewTask {
                title,
                created_by: config.owner.id,
                assignee_id: assignee,
                deadline,
                kind,
                schedule_at,
                schedule_repeat: every,
            })?;
            println!("Added task {id}.");
        }
        TaskCommands::Done { id } => set_status(&store, &id, TaskStatus::Done)?,
        TaskCommands::Cancel { id } => set_status(&store, &id, TaskStatus::Cancelled)?,
    }
    Ok(())
}

fn set_status(store: &Store, id: &str, status: TaskStatus) -> Result<()> {
    if store.set_task_status(id, status)? {
        println!("Task {id} is now {}.", status.as_str());
    } else {
        println!("No task with id {id}.");
    }
    Ok(())
}

fn prompt_with_default(prompt: &str, default: &str) -> Result<String> {
    use std::io::{self, Write};
    print!("{prompt} [{default}]: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let trimmed = input.trim();
    if trimmed.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

/// Initialize configuration and workspace.
fn run_onboard(config_arg: Option<PathBuf>, non_interactive: bool) -> Result<()> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let steward_dir = home.join(".steward");
    std::fs::create_dir_all(&steward_dir)?;

    let config_path = config_arg.unwrap_or_else(|| steward_dir.join("config.json"));
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        println!("To reset, delete it and run `steward onboard` again.");
    } else {
        let mut cfg = Config::default();
        cfg.gate.policy = Some(GatePolicy::Strict);
        if !non_interactive {
            println!("Interactive setup");
            let owner_id = prompt_with_default("Owner Telegram user id", "")?;
            if !owner_id.is_empty() {
                cfg.owner.id = Some(
                    owner_id
                        .parse()
                        .with_context(|| format!("invalid user id '{owner_id}'"))?,
                );
            }
            cfg.owner.name = prompt_with_default("Owner name", "")?;
            let link = prompt_with_default("Owner contact for external users (e.g. @handle)", "")?;
            cfg.owner.link = (!link.is_empty()).then_some(link);
            cfg.telegram.token = prompt_with_default("Telegram bot token", "")?;
            let policy = prompt_with_default("Gate policy (strict/autoGrant)", "strict")?;
            cfg.gate.policy = Some(match policy.to_lowercase().as_str() {
                "autogrant" | "auto" => GatePolicy::AutoGrant,
                _ => GatePolicy::Strict,
            });
            let backend = prompt_with_default("Agent backend (claude-cli/rig)", "claude-cli")?;
            cfg.agent.backend = match backend.to_lowercase().as_str() {
                "rig" => BackendKind::Rig,
                _ => BackendKind::ClaudeCli,
            };
            cfg.agent.workspace = prompt_with_default("Workspace path", &cfg.agent.workspace)?;
        }
        save_config(&config_path, &cfg)?;
        println!("Created config: {}", config_path.display());
    }

    let config = load_config(&config_path)?;
    let workspace = resolve_path(&config.agent.workspace);
    std::fs::create_dir_all(&workspace)?;
    println!("Workspace: {}", workspace.display());

    let instructions = workspace.join("CLAUDE.md");
    if !instructions.exists() {
        std::fs::write(
            &instructions,
            "# Assistant Notes\n\nDescribe the owner's projects, people and routines here.\n",
        )?;
        println!("  Created CLAUDE.md");
    }

    println!();
    println!("Setup complete! Next steps:");
    println!("  1. Check owner.id and telegram.token in {}", config_path.display());
    println!("  2. Run `steward chat` to talk to the assistant locally");
    println!("  3. Run `steward serve` to start the bot");
    println!();
    Ok(())
}

/// Show configuration and state summary.
fn run_status(config_path: &Path) -> Result<()> {
    println!("steward status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!(
            "  Config:    {} (not found, run `steward onboard`)",
            config_path.display()
        );
        return Ok(());
    }

    let config = load_config(config_path)?;
    match config.owner_id() {
        Ok(id) => println!("  Owner:     {id} {}", config.owner.name),
        Err(_) => println!("  Owner:     (not set)"),
    }
    let workspace = resolve_path(&config.agent.workspace);
    println!(
        "  Workspace: {} ({})",
        workspace.display(),
        if workspace.exists() { "found" } else { "not found" }
    );
    match config.agent.backend {
        BackendKind::ClaudeCli => println!("  Backend:   claude-cli ({})", config.agent.claude.command),
        BackendKind::Rig => println!(
            "  Backend:   rig ({}/{})",
            config.agent.model.provider, config.agent.model.model
        ),
    }
    println!(
        "  Gate:      {}",
        match config.gate.policy {
            Some(GatePolicy::Strict) => "strict",
            Some(GatePolicy::AutoGrant) => "autoGrant",
            None => "(not set)",
        }
    );
    println!(
        "  Telegram:  {}",
        if config.telegram.token.is_empty() {
            "not configured"
        } else {
            "configured"
        }
    );
    if config.heartbeat.interval_minutes == 0 {
        println!("  Heartbeat: disabled");
    } else {
        println!(
            "  Heartbeat: every {} min",
            config.heartbeat.interval_minutes
        );
    }
    println!();

    let tokens = TokenStore::new(resolve_path(&config.sessions.dir));
    println!("  Sessions:  {} stored", tokens.stored_ids().len());

    let store_path = resolve_path(&config.store.path);
    if store_path.exists() {
        let store = Store::open(&store_path)?;
        let open = store.open_tasks()?;
        let overdue = open.iter().filter(|t| t.is_overdue(Utc::now())).count();
        println!(
            "  Tasks:     {} open, {overdue} overdue ({})",
            open.len(),
            store_path.display()
        );
    } else {
        println!("  Tasks:     no store yet ({})", store_path.display());
    }
    Ok(())
}
