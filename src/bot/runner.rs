//! Telegram transport runtime.

use crate::bot::handlers::{self, Command};
use crate::config::Settings;
use crate::plugin::{find_image_url, VisionParser};
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing::{error, info};

/// Poll Telegram and dispatch updates to the plugin until Ctrl-C.
pub async fn run_bot(settings: Arc<Settings>, parser: Arc<VisionParser>) {
    let bot = Bot::new(settings.telegram_token.clone());
    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![settings, parser])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    Update::filter_message()
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(
            dptree::filter(|msg: Message| msg.text().and_then(find_image_url).is_some())
                .endpoint(handle_image_link),
        )
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    parser: Arc<VisionParser>,
    settings: Arc<Settings>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::command(bot, msg, cmd, parser, settings).await {
        error!("Command error: {:#}", e);
    }
    respond(())
}

async fn handle_image_link(
    bot: Bot,
    msg: Message,
    parser: Arc<VisionParser>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::image_link(bot, msg, parser).await {
        error!("Image link handler error: {:#}", e);
    }
    respond(())
}
