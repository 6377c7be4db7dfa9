use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, FileId, InputFile, MessageId, ReplyParameters};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::CONFIG;
use crate::handlers::access::{check_access_control, is_rate_limited};
use crate::painter::{run_draw, DrawChannel, DrawNotice, DrawOutcome, DrawSettings, HttpPainter};
use crate::state::AppState;
use crate::utils::telegram::{reply_text, start_chat_action_heartbeat};
use crate::utils::timing::{complete_command_timer, start_command_timer};

const RESULT_FILE_NAME: &str = "drawing.png";

/// Largest photo size, or an image sent as a document.
pub fn image_file_id(message: &Message) -> Option<FileId> {
    if let Some(photo) = message.photo().and_then(|sizes| sizes.last()) {
        return Some(photo.file.id.clone());
    }

    message
        .document()
        .filter(|document| {
            document
                .mime_type
                .as_ref()
                .is_some_and(|mime| mime.type_() == "image")
        })
        .map(|document| document.file.id.clone())
}

pub struct TelegramDrawChannel {
    bot: Bot,
    chat_id: ChatId,
    reply_to: MessageId,
    file_id: FileId,
}

impl TelegramDrawChannel {
    pub fn new(bot: Bot, chat_id: ChatId, reply_to: MessageId, file_id: FileId) -> Self {
        Self {
            bot,
            chat_id,
            reply_to,
            file_id,
        }
    }
}

#[async_trait]
impl DrawChannel for TelegramDrawChannel {
    async fn fetch_image(&self, dest: &Path) -> anyhow::Result<()> {
        let file = self.bot.get_file(self.file_id.clone()).await?;
        let mut destination = tokio::fs::File::create(dest).await?;
        self.bot.download_file(&file.path, &mut destination).await?;
        destination.flush().await?;
        info!(
            chat_id = self.chat_id.0,
            size = file.meta.size,
            "Downloaded image for drawing"
        );
        Ok(())
    }

    async fn notify(&self, notice: DrawNotice) {
        if notice.is_progress() {
            debug!(chat_id = self.chat_id.0, "Drawing progress: {notice}");
        }
        if let Err(err) = reply_text(&self.bot, self.chat_id, self.reply_to, notice.to_string()).await
        {
            warn!(chat_id = self.chat_id.0, "Failed to send drawing notice: {err}");
        }
    }

    async fn reply_image(&self, image: Vec<u8>) -> anyhow::Result<()> {
        let photo = self
            .bot
            .send_photo(self.chat_id, InputFile::memory(image.clone()))
            .reply_parameters(ReplyParameters::new(self.reply_to).allow_sending_without_reply())
            .await;
        if let Err(err) = photo {
            warn!("send_photo failed, sending the drawing as a document: {err}");
            self.bot
                .send_document(
                    self.chat_id,
                    InputFile::memory(image).file_name(RESULT_FILE_NAME),
                )
                .reply_parameters(ReplyParameters::new(self.reply_to).allow_sending_without_reply())
                .await?;
        }
        Ok(())
    }
}

pub async fn draw_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(file_id) = image_file_id(&message) else {
        return Ok(());
    };
    let chat_id = message.chat.id;

    if state.draw_session(chat_id.0).is_none() {
        if message.chat.is_private() {
            reply_text(
                &bot,
                chat_id,
                message.id,
                "Send /paint first to turn on drawing mode, then send the image again.",
            )
            .await?;
        }
        return Ok(());
    }

    if !check_access_control(&bot, &message).await {
        return Ok(());
    }
    let user_id = message
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())
        .unwrap_or_default();
    if is_rate_limited(user_id) {
        reply_text(
            &bot,
            chat_id,
            message.id,
            "Rate limit exceeded. Please try again later.",
        )
        .await?;
        return Ok(());
    }

    let mut timer = start_command_timer("draw", &message);
    let job = state.begin_draw(chat_id.0);
    let _chat_action = start_chat_action_heartbeat(
        bot.clone(),
        chat_id,
        ChatAction::UploadPhoto,
        job.token().clone(),
    );

    let channel = TelegramDrawChannel::new(bot.clone(), chat_id, message.id, file_id);
    let api = HttpPainter::shared(CONFIG.painter_http_timeout());
    let settings = DrawSettings::from_config(&CONFIG);
    let outcome = run_draw(&api, &channel, &settings, job.token()).await;

    let detail = match &outcome {
        DrawOutcome::Disabled => None,
        DrawOutcome::Aborted(err) => Some(err.to_string()),
        DrawOutcome::Delivered { task_id, saved_to } => Some(format!(
            "task_id={task_id} saved_to={}",
            saved_to
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        )),
        DrawOutcome::Undeliverable { task_id, detail } => {
            Some(format!("task_id={task_id} {detail}"))
        }
    };
    complete_command_timer(&mut timer, outcome.status_label(), detail);
    Ok(())
}
