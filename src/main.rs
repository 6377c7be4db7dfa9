use std::error::Error;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info};

mod config;
mod handlers;
mod painter;
mod state;
mod utils;

use config::CONFIG;
use handlers::{commands, draw};
use state::AppState;
use utils::logging::init_logging;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Help,
    Paint,
    Stop,
    Status,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging();

    if CONFIG.bot_token.trim().is_empty() {
        return Err("BOT_TOKEN is required".into());
    }

    let bot = Bot::new(CONFIG.bot_token.clone());
    info!(
        painter_url_file = %CONFIG.painter_url_file.display(),
        output_dir = %CONFIG.output_dir.display(),
        "Starting painter bot"
    );

    let state = AppState::new();
    handlers::access::load_whitelist();

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(
            dptree::filter(|msg: Message| draw::image_file_id(&msg).is_some())
                .endpoint(handle_image_message),
        )
        .endpoint(ignore_message);

    Dispatcher::builder(bot, message_handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    match command {
        Command::Start => commands::start_handler(bot, message).await?,
        Command::Help => commands::help_handler(bot, message).await?,
        Command::Paint => commands::paint_handler(bot, state, message).await?,
        Command::Stop => commands::stop_handler(bot, state, message).await?,
        Command::Status => commands::status_handler(bot, state, message).await?,
    }
    Ok(())
}

async fn handle_image_message(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    // A drawing can take minutes; keep the dispatcher free for other updates.
    tokio::spawn(async move {
        if let Err(err) = draw::draw_handler(bot, state, message).await {
            error!("draw handler failed: {err}");
        }
    });
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}
