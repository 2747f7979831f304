//! Telegram command and message handlers.

use crate::bot::responder::TelegramResponder;
use crate::config::Settings;
use crate::plugin::{PipelineOutcome, Responder, VisionParser};
use anyhow::Result;
use std::sync::Arc;
use teloxide::{prelude::*, utils::command::BotCommands};
use tracing::{debug, info, warn};

/// Reply sent to non-admins attempting a privileged command
pub const ACCESS_DENIED_REPLY: &str = "⛔️ Access denied";

/// Supported commands for the bot
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "snake_case", description = "Supported commands:")]
pub enum Command {
    /// Show today's annotation usage
    #[command(description = "Show today's annotation quota.")]
    Quota,
    /// Reset the daily counter (admins only)
    #[command(description = "Reset the daily quota (admins only).")]
    ResetQuota,
}

/// Telegram ID of the sender, or 0 for anonymous/channel posts
#[must_use]
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// Handle `/quota` and `/reset_quota`
///
/// # Errors
///
/// Returns an error if the quota store fails or a reply cannot be sent.
pub async fn command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    parser: Arc<VisionParser>,
    settings: Arc<Settings>,
) -> Result<()> {
    let responder = TelegramResponder::new(bot, msg.chat.id);
    match cmd {
        Command::Quota => parser.quota(&responder).await,
        Command::ResetQuota => {
            let user_id = get_user_id_safe(&msg);
            if settings.admin_users().contains(&user_id) {
                info!(user_id, "Quota reset requested");
                parser.reset_quota(&responder).await
            } else {
                warn!(user_id, "Rejected quota reset from non-admin");
                responder.say(ACCESS_DENIED_REPLY).await
            }
        }
    }
}

/// Run the annotation pipeline for a message containing an image link
///
/// # Errors
///
/// Returns an error if the quota store or annotation call fails, or a reply
/// cannot be sent.
pub async fn image_link(bot: Bot, msg: Message, parser: Arc<VisionParser>) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let responder = TelegramResponder::new(bot, msg.chat.id);

    if let Some(outcome) = parser.handle_message(text, &responder).await? {
        debug!(chat_id = msg.chat.id.0, ?outcome, "Image link handled");
        if let PipelineOutcome::Annotated(count) = outcome {
            info!(count, "Annotation posted");
        }
    }
    Ok(())
}
