//! Telegram transport: command, file, callback and text handlers.
//!
//! Uploads are handed to [`UploadPipeline`] on their own task so a long
//! transfer never holds up the dispatcher for that chat.

use crate::error::LookupError;
use crate::messages;
use crate::metadata_store::{FileAttributes, MetadataStore, UserRecord};
use crate::object_gateway::ObjectStorageGateway;
use crate::progress::StatusSink;
use crate::upload_pipeline::{check_size, FileKind, InboundFile, UploadPipeline, UploadSummary};
use crate::web::{download_link, player_link, PublicLinks};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use teloxide::net::Download;
use teloxide::payloads::{EditMessageTextSetters, SendMessageSetters};
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, User};
use teloxide::utils::command::BotCommands;
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Files shown by `/list`
const LIST_LIMIT: usize = 10;

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    #[command(description = "welcome message")]
    Start,
    #[command(description = "show help")]
    Help,
    #[command(description = "list your files")]
    List,
    #[command(description = "web interface link")]
    Web,
}

/// Inline button actions, parsed from callback data
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackAction {
    UploadHelp,
    ListFiles,
    Download(Uuid),
    Player(Uuid),
    Unknown,
}

impl CallbackAction {
    pub fn parse(data: &str) -> Self {
        match data {
            "upload_help" => return Self::UploadHelp,
            "list_files" => return Self::ListFiles,
            _ => {}
        }

        let parse_id = |raw: &str| Uuid::parse_str(raw).ok();
        if let Some(id) = data.strip_prefix("download_").and_then(parse_id) {
            Self::Download(id)
        } else if let Some(id) = data.strip_prefix("mx_").and_then(parse_id) {
            Self::Player(id)
        } else {
            Self::Unknown
        }
    }
}

/// Services shared by every handler
pub struct BotDeps {
    pub pipeline: Arc<UploadPipeline>,
    pub store: Arc<dyn MetadataStore>,
    pub gateway: Arc<dyn ObjectStorageGateway>,
    pub links: Option<PublicLinks>,
    pub download_url_expiry: Duration,
}

/// Build a bot, pointing it at a custom Bot API server when configured
pub fn build_bot(token: &str, api_url: Option<&str>) -> Result<Bot> {
    let bot = Bot::new(token);
    match api_url {
        Some(url) => {
            let url = url.parse().context("Invalid telegram.api_url")?;
            Ok(bot.set_api_url(url))
        }
        None => Ok(bot),
    }
}

/// Run the dispatcher until the task is aborted
pub async fn run_bot(bot: Bot, deps: Arc<BotDeps>) {
    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command),
                )
                .branch(dptree::filter_map(inbound_file).endpoint(handle_file))
                .branch(dptree::endpoint(handle_text)),
        )
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    info!("Starting Telegram dispatcher");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![deps])
        .default_handler(|update| async move {
            debug!(update_id = ?update.id, "Unhandled update");
        })
        .build()
        .dispatch()
        .await;
}

fn user_record(user: &User) -> UserRecord {
    UserRecord {
        user_id: user.id.0 as i64,
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        last_seen_at: Utc::now(),
    }
}

/// Upsert the user; bookkeeping failures never block a reply
async fn remember_user(store: &dyn MetadataStore, user: Option<&User>) {
    let Some(user) = user else { return };
    if let Err(e) = store.save_user(&user_record(user)).await {
        warn!(error = ?e, user_id = user.id.0, "Failed to save user");
    }
}

fn start_keyboard(links: Option<&PublicLinks>) -> InlineKeyboardMarkup {
    let mut rows = vec![
        vec![InlineKeyboardButton::callback("Upload File", "upload_help")],
        vec![InlineKeyboardButton::callback("My Files", "list_files")],
    ];
    if let Some(button) = links.and_then(|l| url_button("Web Interface", l.home())) {
        rows.push(vec![button]);
    }
    InlineKeyboardMarkup::new(rows)
}

fn upload_keyboard(file_id: Uuid, links: Option<&PublicLinks>) -> InlineKeyboardMarkup {
    let mut rows = vec![vec![InlineKeyboardButton::callback(
        "Download",
        format!("download_{}", file_id),
    )]];

    if let Some(links) = links {
        let web_row: Vec<_> = [
            url_button("View Web", &links.stream(file_id)),
            url_button("Stream", &links.player(file_id)),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !web_row.is_empty() {
            rows.push(web_row);
        }
        rows.push(vec![InlineKeyboardButton::callback(
            "MX Player",
            format!("mx_{}", file_id),
        )]);
    }

    InlineKeyboardMarkup::new(rows)
}

fn url_button(text: &str, url: &str) -> Option<InlineKeyboardButton> {
    match url.parse() {
        Ok(url) => Some(InlineKeyboardButton::url(text.to_string(), url)),
        Err(e) => {
            warn!(error = %e, url = %url, "Skipping button with invalid URL");
            None
        }
    }
}

#[instrument(skip(bot, msg, deps), fields(chat_id = %msg.chat.id))]
async fn handle_command(bot: Bot, msg: Message, cmd: Command, deps: Arc<BotDeps>) -> Result<()> {
    remember_user(deps.store.as_ref(), msg.from.as_ref()).await;

    match cmd {
        Command::Start => {
            bot.send_message(msg.chat.id, messages::WELCOME)
                .reply_markup(start_keyboard(deps.links.as_ref()))
                .await?;
        }
        Command::Help => {
            bot.send_message(msg.chat.id, messages::HELP).await?;
        }
        Command::List => {
            let Some(user) = msg.from.as_ref() else {
                return Ok(());
            };
            send_file_list(&bot, msg.chat.id, deps.store.as_ref(), user.id.0 as i64).await?;
        }
        Command::Web => {
            let text = match &deps.links {
                Some(links) => messages::web_interface(links.home()),
                None => messages::WEB_NOT_CONFIGURED.to_string(),
            };
            bot.send_message(msg.chat.id, text).await?;
        }
    }

    Ok(())
}

async fn send_file_list(
    bot: &Bot,
    chat_id: ChatId,
    store: &dyn MetadataStore,
    uploader_id: i64,
) -> Result<()> {
    let text = match store.list_files_by_uploader(uploader_id, LIST_LIMIT).await {
        Ok(files) => messages::file_list(&files),
        Err(e) => {
            warn!(error = ?e, uploader_id = uploader_id, "Failed to list files");
            messages::LINK_UNAVAILABLE.to_string()
        }
    };
    bot.send_message(chat_id, text).await?;
    Ok(())
}

/// Inbound file plus the Telegram reference used to download it
#[derive(Debug, Clone)]
pub struct TelegramFile {
    pub inbound: InboundFile,
    pub telegram_file_id: String,
}

fn generated_name(extension: &str) -> String {
    format!("media_{}{}", Utc::now().timestamp(), extension)
}

/// Normalize a document, video, audio or photo message
pub fn inbound_file(msg: Message) -> Option<TelegramFile> {
    let (kind, meta, name, mime_type, attributes) = if let Some(doc) = msg.document() {
        (
            FileKind::Document,
            &doc.file,
            doc.file_name.clone(),
            doc.mime_type.as_ref().map(|m| m.to_string()),
            FileAttributes::default(),
        )
    } else if let Some(video) = msg.video() {
        (
            FileKind::Video,
            &video.file,
            video.file_name.clone(),
            video.mime_type.as_ref().map(|m| m.to_string()),
            FileAttributes {
                width: Some(video.width),
                height: Some(video.height),
                duration: Some(video.duration.seconds()),
            },
        )
    } else if let Some(audio) = msg.audio() {
        (
            FileKind::Audio,
            &audio.file,
            audio.file_name.clone(),
            audio.mime_type.as_ref().map(|m| m.to_string()),
            FileAttributes {
                duration: Some(audio.duration.seconds()),
                ..FileAttributes::default()
            },
        )
    } else if let Some(largest) = msg.photo().and_then(|sizes| sizes.last()) {
        (
            FileKind::Photo,
            &largest.file,
            Some(generated_name(".jpg")),
            Some("image/jpeg".to_string()),
            FileAttributes {
                width: Some(largest.width),
                height: Some(largest.height),
                duration: None,
            },
        )
    } else {
        return None;
    };

    let telegram_file_id = meta.id.to_string();
    Some(TelegramFile {
        inbound: InboundFile {
            kind,
            name: name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| generated_name("")),
            size: u64::from(meta.size),
            mime_type,
            attributes,
            source_file_id: Some(telegram_file_id.clone()),
        },
        telegram_file_id,
    })
}

/// Status sink that edits one Telegram message in place
struct TelegramStatus {
    bot: Bot,
    chat_id: ChatId,
    message_id: MessageId,
}

#[async_trait]
impl StatusSink for TelegramStatus {
    async fn update(&self, text: String) {
        if let Err(e) = self
            .bot
            .edit_message_text(self.chat_id, self.message_id, text)
            .await
        {
            debug!(error = %e, "Failed to edit status message");
        }
    }
}

#[instrument(skip(bot, msg, file, deps), fields(chat_id = %msg.chat.id, file_name = %file.inbound.name))]
async fn handle_file(bot: Bot, msg: Message, file: TelegramFile, deps: Arc<BotDeps>) -> Result<()> {
    remember_user(deps.store.as_ref(), msg.from.as_ref()).await;
    let Some(uploader_id) = msg.from.as_ref().map(|u| u.id.0 as i64) else {
        return Ok(());
    };

    if let Some(text) = early_rejection(&file.inbound) {
        bot.send_message(msg.chat.id, text).await?;
        return Ok(());
    }

    if let Err(e) = bot
        .send_chat_action(msg.chat.id, ChatAction::UploadDocument)
        .await
    {
        debug!(error = %e, "Failed to send chat action");
    }

    let status = bot
        .send_message(msg.chat.id, messages::upload_started(&file.inbound.name))
        .await?;

    tokio::spawn(async move {
        let chat_id = msg.chat.id;
        let file_name = file.inbound.name.clone();
        let outcome = relay_file(&bot, chat_id, status.id, file, uploader_id, &deps).await;

        let result = match outcome {
            Ok(summary) => bot
                .edit_message_text(chat_id, status.id, messages::upload_complete(&summary))
                .reply_markup(upload_keyboard(summary.record.file_id, deps.links.as_ref()))
                .await
                .map(|_| ()),
            Err(text) => {
                warn!(file_name = %file_name, reason = %text, "Upload did not complete");
                bot.edit_message_text(chat_id, status.id, text)
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "Failed to report upload result");
        }
    });

    Ok(())
}

/// Rejection text for files refused before any transfer starts
fn early_rejection(file: &InboundFile) -> Option<String> {
    check_size(file.size)
        .err()
        .map(|e| e.user_message(&file.name))
}

/// Download from Telegram and run the pipeline; errors come back as user text
async fn relay_file(
    bot: &Bot,
    chat_id: ChatId,
    status_id: MessageId,
    file: TelegramFile,
    uploader_id: i64,
    deps: &BotDeps,
) -> std::result::Result<UploadSummary, String> {
    let file_name = file.inbound.name.clone();

    let remote = match bot.get_file(file.telegram_file_id.clone()).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(error = %e, "Failed to resolve Telegram file");
            return Err(messages::upload_failed(&file_name));
        }
    };

    let stream = bot
        .download_file_stream(&remote.path)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let reader = StreamReader::new(Box::pin(stream));

    let status: Arc<dyn StatusSink> = Arc::new(TelegramStatus {
        bot: bot.clone(),
        chat_id,
        message_id: status_id,
    });

    deps.pipeline
        .handle(file.inbound, uploader_id, reader, status)
        .await
        .map_err(|e| e.user_message(&file_name))
}

#[instrument(skip(bot, q, deps), fields(user_id = q.from.id.0))]
async fn handle_callback(bot: Bot, q: CallbackQuery, deps: Arc<BotDeps>) -> Result<()> {
    remember_user(deps.store.as_ref(), Some(&q.from)).await;

    if let Err(e) = bot.answer_callback_query(q.id.clone()).await {
        debug!(error = %e, "Failed to answer callback query");
    }

    let chat_id = reply_chat(&q);
    let action = q
        .data
        .as_deref()
        .map(CallbackAction::parse)
        .unwrap_or(CallbackAction::Unknown);

    match action {
        CallbackAction::UploadHelp => {
            bot.send_message(chat_id, messages::UPLOAD_HELP).await?;
        }
        CallbackAction::ListFiles => {
            send_file_list(&bot, chat_id, deps.store.as_ref(), q.from.id.0 as i64).await?;
        }
        CallbackAction::Download(file_id) => {
            let link = download_link(
                deps.store.as_ref(),
                deps.gateway.as_ref(),
                file_id,
                deps.download_url_expiry,
            )
            .await;

            match link {
                Ok((record, url)) => {
                    let mut request =
                        bot.send_message(chat_id, messages::download_ready(&record.original_name));
                    if let Some(button) = url_button("Download Now", &url) {
                        request = request.reply_markup(InlineKeyboardMarkup::new(vec![vec![button]]));
                    }
                    request.await?;
                }
                Err(e) => {
                    bot.send_message(chat_id, lookup_failure_text(&e)).await?;
                }
            }
        }
        CallbackAction::Player(file_id) => {
            match player_link(deps.store.as_ref(), deps.gateway.as_ref(), file_id).await {
                // Intent links are not accepted as URL buttons
                Ok((record, intent)) => {
                    bot.send_message(chat_id, messages::player_ready(&record.original_name, &intent))
                        .await?;
                }
                Err(e) => {
                    bot.send_message(chat_id, lookup_failure_text(&e)).await?;
                }
            }
        }
        CallbackAction::Unknown => {
            debug!(data = ?q.data, "Ignoring unknown callback data");
        }
    }

    Ok(())
}

/// Chat holding the pressed button; private chat with the presser otherwise
fn reply_chat(q: &CallbackQuery) -> ChatId {
    q.message
        .as_ref()
        .map(|m| m.chat().id)
        .unwrap_or_else(|| q.from.id.into())
}

fn lookup_failure_text(e: &LookupError) -> &'static str {
    match e {
        LookupError::NotFound(_) => messages::FILE_NOT_FOUND,
        LookupError::UrlUnavailable(_) | LookupError::Store(_) => {
            warn!(error = %e, "Link lookup failed");
            messages::LINK_UNAVAILABLE
        }
    }
}

async fn handle_text(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> Result<()> {
    remember_user(deps.store.as_ref(), msg.from.as_ref()).await;

    if msg.text().is_some() {
        bot.send_message(msg.chat.id, messages::SEND_FILE_HINT).await?;
    }
    Ok(())
}
