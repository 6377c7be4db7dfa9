use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{ChatAction, MessageId, ReplyParameters};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const CHAT_ACTION_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

/// Keeps a chat action visible until dropped or until `cancel` fires.
pub struct ChatActionHeartbeat {
    task_handle: Option<JoinHandle<()>>,
}

impl Drop for ChatActionHeartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

pub fn start_chat_action_heartbeat(
    bot: Bot,
    chat_id: ChatId,
    action: ChatAction,
    cancel: CancellationToken,
) -> ChatActionHeartbeat {
    let task_handle = tokio::spawn(async move {
        loop {
            if let Err(err) = bot.send_chat_action(chat_id, action.clone()).await {
                warn!("send_chat_action failed: {err}");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(CHAT_ACTION_HEARTBEAT_INTERVAL) => {}
            }
        }
    });

    ChatActionHeartbeat {
        task_handle: Some(task_handle),
    }
}

pub async fn reply_text(
    bot: &Bot,
    chat_id: ChatId,
    reply_to: MessageId,
    text: impl Into<String>,
) -> Result<Message, teloxide::RequestError> {
    bot.send_message(chat_id, text)
        .reply_parameters(ReplyParameters::new(reply_to).allow_sending_without_reply())
        .await
}
