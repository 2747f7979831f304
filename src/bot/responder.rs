//! Telegram implementation of the plugin's reply sink.

use crate::plugin::Responder;
use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, ParseMode};

/// Maximum message length for Telegram with safety margin.
/// Telegram's official limit is 4096, but we use 4000 to account for
/// the HTML tags wrapped around preformatted blocks.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4000;

/// Replies into one Telegram chat
pub struct TelegramResponder {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramResponder {
    /// Create a responder bound to `chat_id`
    #[must_use]
    pub const fn new(bot: Bot, chat_id: ChatId) -> Self {
        Self { bot, chat_id }
    }
}

#[async_trait]
impl Responder for TelegramResponder {
    async fn say(&self, text: &str) -> Result<()> {
        self.bot.send_message(self.chat_id, text).await?;
        Ok(())
    }

    async fn say_block(&self, lines: &[String]) -> Result<()> {
        for chunk in chunk_lines(lines, TELEGRAM_MESSAGE_LIMIT) {
            let html = format!("<pre>{}</pre>", html_escape::encode_text(&chunk));
            self.bot
                .send_message(self.chat_id, html)
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Ok(())
    }
}

/// Join `lines` into newline-separated chunks of at most `limit` bytes.
///
/// Lines are never split unless a single line is longer than `limit` on its
/// own, in which case it is cut at character boundaries.
#[must_use]
pub fn chunk_lines(lines: &[String], limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in lines {
        for piece in split_oversized(line, limit) {
            let needed = if current.is_empty() {
                piece.len()
            } else {
                current.len() + 1 + piece.len()
            };
            if needed > limit && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(piece);
        }
    }

    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_oversized(line: &str, limit: usize) -> Vec<&str> {
    if line.len() <= limit || limit == 0 {
        return vec![line];
    }

    let mut pieces = Vec::new();
    let mut rest = line;
    while rest.len() > limit {
        let cut = (1..=limit)
            .rev()
            .find(|i| rest.is_char_boundary(*i))
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    pieces.push(rest);
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_short_report_is_one_chunk() {
        let chunks = chunk_lines(&lines(&["======= SFW =======", "", "cat"]), 100);
        assert_eq!(chunks, vec!["======= SFW =======\n\ncat".to_string()]);
    }

    #[test]
    fn test_chunks_break_between_lines() {
        let chunks = chunk_lines(&lines(&["aaaa", "bbbb", "cccc"]), 9);
        assert_eq!(chunks, vec!["aaaa\nbbbb".to_string(), "cccc".to_string()]);
        assert!(chunks.iter().all(|c| c.len() <= 9));
    }

    #[test]
    fn test_oversized_line_is_cut_on_char_boundaries() {
        let chunks = chunk_lines(&lines(&["ééééé"]), 4);
        assert_eq!(chunks, vec!["éé".to_string(), "éé".to_string(), "é".to_string()]);
    }

    #[test]
    fn test_empty_input_yields_single_empty_chunk() {
        assert_eq!(chunk_lines(&[], 10), vec![String::new()]);
    }
}
