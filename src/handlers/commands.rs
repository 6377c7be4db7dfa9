use anyhow::Result;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::{ParseMode, ReplyParameters};
use tracing::warn;

use crate::config::{read_painter_base_url, CONFIG};
use crate::handlers::access::check_access_control;
use crate::painter::DrawSettings;
use crate::state::AppState;
use crate::utils::telegram::reply_text;

fn bool_label(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn user_id_of(message: &Message) -> i64 {
    message
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())
        .unwrap_or_default()
}

pub async fn start_handler(bot: Bot, message: Message) -> Result<()> {
    reply_text(
        &bot,
        message.chat.id,
        message.id,
        "Hello! I turn your pictures into anime-style drawings. Send /paint to start, then send me an image.",
    )
    .await?;
    Ok(())
}

pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    let help_text = "
*Painter Bot Commands*

/paint - Enter drawing mode in this chat
Usage: send `/paint`, then send a photo (or an image file). The bot repaints it and replies with the result.

/stop - Leave drawing mode and cancel any drawing still running in this chat
Usage: `/stop`

/status - Show whether the drawing service is available and what is running here
Usage: `/status`

/help - Show this help message
";

    bot.send_message(message.chat.id, help_text)
        .reply_parameters(ReplyParameters::new(message.id))
        .parse_mode(ParseMode::Markdown)
        .await?;
    Ok(())
}

pub async fn paint_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_access_control(&bot, &message).await {
        return Ok(());
    }

    let text = if state.enter_draw_mode(message.chat.id.0, user_id_of(&message)) {
        "Drawing mode is on. Send me an image and I will repaint it. Use /stop to leave."
    } else {
        "Drawing mode is already on. Send me an image, or /stop to leave."
    };
    reply_text(&bot, message.chat.id, message.id, text).await?;
    Ok(())
}

/// Leaves drawing mode for the chat. Callers that failed access control get
/// `None` and change nothing.
fn stop_drawing(state: &AppState, chat_id: i64, allowed: bool) -> Option<String> {
    if !allowed {
        return None;
    }
    let was_drawing = state.draw_session(chat_id).is_some();
    let cancelled = state.leave_draw_mode(chat_id);

    Some(match (was_drawing, cancelled) {
        (false, 0) => "Drawing mode is not on.".to_string(),
        (_, 0) => "Drawing mode is off.".to_string(),
        (_, count) => format!("Drawing mode is off. Cancelled {count} running drawing(s)."),
    })
}

pub async fn stop_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let allowed = check_access_control(&bot, &message).await;
    let Some(text) = stop_drawing(&state, message.chat.id.0, allowed) else {
        return Ok(());
    };
    reply_text(&bot, message.chat.id, message.id, text).await?;
    Ok(())
}

fn build_status_report(state: &AppState, chat_id: i64, settings: &DrawSettings) -> String {
    let painter = read_painter_base_url(&settings.painter_url_file);
    let painter_status = match &painter {
        Ok(Some(_)) => "configured",
        Ok(None) => "disabled",
        Err(err) => {
            warn!("Painter url unusable: {err}");
            "invalid"
        }
    };
    let session = state.draw_session(chat_id);

    let mut report = String::new();
    report.push_str("Status snapshot\n");
    report.push_str(&format!("time_utc: {}\n", Utc::now().to_rfc3339()));
    report.push_str(&format!("painter: {painter_status}\n"));
    report.push_str(&format!("draw_mode: {}\n", bool_label(session.is_some())));
    if let Some(session) = session {
        report.push_str(&format!(
            "draw_mode_since: {} (by user {})\n",
            session.entered_at.to_rfc3339(),
            session.user_id
        ));
    }
    report.push_str(&format!("in_flight: {}\n", state.in_flight_count(chat_id)));
    report.push_str(&format!(
        "poll: interval={}s backoff={} max_interval={}s timeout={}\n",
        settings.poll.interval.as_secs(),
        settings.poll.backoff_factor,
        settings.poll.max_interval.as_secs(),
        settings
            .poll
            .timeout
            .map(|timeout| format!("{}s", timeout.as_secs()))
            .unwrap_or_else(|| "none".to_string())
    ));
    report.push_str(&format!("output_dir: {}\n", settings.output_dir.display()));
    report
}

pub async fn status_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_access_control(&bot, &message).await {
        return Ok(());
    }

    let settings = DrawSettings::from_config(&CONFIG);
    let report = build_status_report(&state, message.chat.id.0, &settings);
    reply_text(&bot, message.chat.id, message.id, report).await?;
    Ok(())
}
