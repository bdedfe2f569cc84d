//! Telegram channel using teloxide.
//!
//! Features:
//! - Long polling (no webhook/public IP needed)
//! - Private chats only; every non-owner sender passes the recipient gate
//! - One resumable session per sender
//! - Typing indicator while the agent works
//! - Proxy support
//! - /start, /new, /help slash commands

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::dispatching::ShutdownToken;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, ChatAction};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use steward_config::TelegramConfig;
use steward_core::identity::display_name;
use steward_core::text::split_message;
use steward_core::{IdentityDirectory, Recipient, RecipientGate, SessionManager, Transport};

const HELP_TEXT: &str = "\
/new - start a new conversation
/help - show this message

Anything else is passed to the assistant.";

/// Build a bot with an optional proxy.
fn build_bot(config: &TelegramConfig) -> Result<Bot> {
    if config.token.is_empty() {
        return Err(anyhow::anyhow!("Telegram bot token not configured"));
    }
    let bot = match config.proxy.as_deref() {
        Some(proxy_url) if !proxy_url.is_empty() => {
            let client = reqwest::Client::builder()
                .proxy(reqwest::Proxy::all(proxy_url)?)
                .build()?;
            Bot::with_client(&config.token, client)
        }
        _ => Bot::new(&config.token),
    };
    Ok(bot)
}

/// Outbound delivery through the Bot API.
pub struct TelegramTransport {
    bot: Bot,
    max_length: usize,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig, max_length: usize) -> Result<Self> {
        Ok(Self {
            bot: build_bot(config)?,
            max_length,
        })
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, recipient_id: i64, text: &str) -> Result<()> {
        send_chunks(&self.bot, ChatId(recipient_id), text, self.max_length).await
    }
}

async fn send_chunks(bot: &Bot, chat_id: ChatId, text: &str, max_length: usize) -> Result<()> {
    for chunk in split_message(text, max_length) {
        if chunk.trim().is_empty() {
            continue;
        }
        bot.send_message(chat_id, chunk).await?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Help,
    New,
}

/// Recognize the bot's own slash commands, including the `/cmd@botname` form.
fn parse_command(text: &str) -> Option<Command> {
    let word = text.trim().split_whitespace().next()?;
    let name = word.strip_prefix('/')?;
    let name = name.split('@').next().unwrap_or(name);
    match name.to_ascii_lowercase().as_str() {
        "start" => Some(Command::Start),
        "help" => Some(Command::Help),
        "new" | "reset" => Some(Command::New),
        _ => None,
    }
}

/// Whether a private message from `recipient` should reach an agent.
/// Admitted external senders have their contact recorded.
async fn admit(
    owner_id: i64,
    gate: &dyn RecipientGate,
    directory: &dyn IdentityDirectory,
    recipient: &Recipient,
) -> bool {
    if recipient.id == owner_id {
        return true;
    }
    match gate.validate(recipient).await {
        Ok(decision) if decision.allowed => {
            if let Err(e) = directory.record_contact(recipient).await {
                warn!("Failed to record contact {}: {e:#}", recipient.id);
            }
            true
        }
        Ok(decision) => {
            info!(
                "Ignoring message from {}: {}",
                recipient.id, decision.reason
            );
            false
        }
        Err(e) => {
            warn!("Gate check for {} failed: {e:#}", recipient.id);
            false
        }
    }
}

struct ChannelContext {
    sessions: Arc<SessionManager>,
    gate: Arc<dyn RecipientGate>,
    directory: Arc<dyn IdentityDirectory>,
    max_length: usize,
}

/// Inbound side: polls for messages and routes them to sessions.
pub struct TelegramChannel {
    bot: Bot,
    context: Arc<ChannelContext>,
    shutdown: std::sync::Mutex<Option<ShutdownToken>>,
}

impl TelegramChannel {
    pub fn new(
        bot: Bot,
        sessions: Arc<SessionManager>,
        gate: Arc<dyn RecipientGate>,
        directory: Arc<dyn IdentityDirectory>,
        max_length: usize,
    ) -> Self {
        Self {
            bot,
            context: Arc::new(ChannelContext {
                sessions,
                gate,
                directory,
                max_length,
            }),
            shutdown: std::sync::Mutex::new(None),
        }
    }

    /// Poll until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<()> {
        info!("Starting Telegram bot (polling mode)...");

        let commands = vec![
            BotCommand::new("new", "Start a new conversation"),
            BotCommand::new("help", "Show available commands"),
        ];
        if let Err(e) = self.bot.set_my_commands(commands).await {
            warn!("Failed to register bot commands: {e}");
        }

        match self.bot.get_me().await {
            Ok(me) => info!(
                "Telegram bot @{} connected",
                me.username.as_deref().unwrap_or("unknown")
            ),
            Err(e) => error!("Failed to get bot info: {e}"),
        }

        if let Err(e) = self.bot.delete_webhook().await {
            warn!("Failed to delete webhook: {e}");
        }

        let handler = Update::filter_message().endpoint(
            |bot: Bot, msg: Message, context: Arc<ChannelContext>| async move {
                handle_message(bot, msg, context).await;
                respond(())
            },
        );

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![Arc::clone(&self.context)])
            .default_handler(|_upd| async {})
            .error_handler(LoggingErrorHandler::with_custom_text(
                "Error in telegram handler",
            ))
            .build();

        if let Ok(mut slot) = self.shutdown.lock() {
            *slot = Some(dispatcher.shutdown_token());
        }
        dispatcher.dispatch().await;

        info!("Telegram bot stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        info!("Stopping Telegram bot...");
        let token = self.shutdown.lock().ok().and_then(|mut slot| slot.take());
        if let Some(token) = token {
            match token.shutdown() {
                Ok(fut) => fut.await,
                Err(e) => warn!("Failed to shutdown dispatcher: {e:?}"),
            }
        }
    }
}

async fn handle_message(bot: Bot, msg: Message, context: Arc<ChannelContext>) {
    if !msg.chat.is_private() {
        debug!("Ignoring message in non-private chat {}", msg.chat.id);
        return;
    }
    let Some(user) = msg.from.as_ref() else {
        return;
    };
    let Ok(sender_id) = i64::try_from(user.id.0) else {
        return;
    };
    let Some(text) = msg.text() else {
        debug!("Ignoring non-text message from {sender_id}");
        return;
    };

    let recipient = Recipient::user(sender_id).with_names(
        user.username.clone(),
        Some(user.first_name.clone()),
        user.last_name.clone(),
    );
    let admitted = admit(
        context.sessions.owner_id(),
        context.gate.as_ref(),
        context.directory.as_ref(),
        &recipient,
    )
    .await;
    if !admitted {
        return;
    }

    let chat_id = msg.chat.id;
    if let Some(command) = parse_command(text) {
        let reply = match command {
            Command::Start => "👋 Hi! Send me a message to get started.".to_string(),
            Command::Help => HELP_TEXT.to_string(),
            Command::New => {
                context.sessions.reset_session(sender_id).await;
                "🔄 Started a new conversation.".to_string()
            }
        };
        if let Err(e) = bot.send_message(chat_id, reply).await {
            error!("Error sending Telegram message: {e}");
        }
        return;
    }

    let name = display_name(
        sender_id,
        user.username.as_deref(),
        Some(&user.first_name),
        user.last_name.as_deref(),
    );
    debug!(
        "Telegram message from {name}: {}",
        text.chars().take(50).collect::<String>()
    );

    let session = context.sessions.get_session(sender_id, Some(&name));
    let typing = start_typing(bot.clone(), chat_id);
    let reply = session.query(text).await;
    typing.abort();

    if let Err(e) = send_chunks(&bot, chat_id, &reply, context.max_length).await {
        error!("Error sending Telegram reply to {sender_id}: {e:#}");
    }
}

/// Refresh the typing indicator until aborted.
fn start_typing(bot: Bot, chat_id: ChatId) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = bot.send_chat_action(chat_id, ChatAction::Typing).await {
                debug!("Typing indicator stopped for {chat_id}: {e}");
                break;
            }
            tokio::time::sleep(Duration::from_secs(4)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_config::GatePolicy;
    use steward_core::{build_gate, Store};

    #[test]
    fn commands_are_recognized() {
        assert_eq!(parse_command("/new"), Some(Command::New));
        assert_eq!(parse_command("  /help  "), Some(Command::Help));
        assert_eq!(parse_command("/start payload"), Some(Command::Start));
        assert_eq!(parse_command("/new@steward_bot"), Some(Command::New));
        assert_eq!(parse_command("/RESET"), Some(Command::New));
    }

    #[test]
    fn other_text_is_not_a_command() {
        assert_eq!(parse_command("new task please"), None);
        assert_eq!(parse_command("/deploy now"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn empty_token_is_rejected() {
        let err = TelegramTransport::new(&TelegramConfig::default(), 4000)
            .err()
            .unwrap();
        assert!(err.to_string().contains("token not configured"));
    }

    #[tokio::test]
    async fn owner_is_always_admitted() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gate = build_gate(GatePolicy::Strict, 1, store.clone());
        assert!(admit(1, gate.as_ref(), store.as_ref(), &Recipient::user(1)).await);
        assert!(store.list_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn strict_gate_drops_unknown_sender() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gate = build_gate(GatePolicy::Strict, 1, store.clone());
        assert!(!admit(1, gate.as_ref(), store.as_ref(), &Recipient::user(5)).await);
        assert!(store.get_user(5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn admitted_sender_contact_is_recorded() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.set_whitelisted(5, true).await.unwrap();
        let gate = build_gate(GatePolicy::Strict, 1, store.clone());
        let recipient = Recipient::user(5).with_names(Some("zed".into()), Some("Zed".into()), None);

        assert!(admit(1, gate.as_ref(), store.as_ref(), &recipient).await);
        let user = store.get_user(5).await.unwrap().unwrap();
        assert_eq!(user.username.as_deref(), Some("zed"));
        assert!(user.is_whitelisted);
    }

    #[tokio::test]
    async fn banned_sender_is_dropped_under_auto_grant() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.set_banned(5, true).await.unwrap();
        let gate = build_gate(GatePolicy::AutoGrant, 1, store.clone());
        assert!(!admit(1, gate.as_ref(), store.as_ref(), &Recipient::user(5)).await);
    }
}
