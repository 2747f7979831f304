//! Message-driven annotation pipeline
//!
//! [`VisionParser`] is independent of the chat platform: it receives a URL or
//! a command and writes its replies to a [`Responder`]. The Telegram layer in
//! [`crate::bot`] only adapts updates to these calls.

use crate::config::DAILY_QUOTA;
use crate::fetcher::ImageSource;
use crate::format::render_report;
use crate::quota::QuotaTracker;
use crate::vision::Annotator;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lazy_regex::regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Sent before the annotation call and as the set-up of the failure joke
pub const ACK_REPLY: &str = "crunshing image...";
/// Punchline sent after a failed download
pub const FAILURE_REPLY: &str = "not! :-p";
/// Sent instead of annotating once the daily ceiling is hit
pub const QUOTA_EXCEEDED_REPLY: &str = "max calls per day reached!";
/// Sent before the quota is reset
pub const RESET_REPLY: &str = "resetting quota";

const DEFAULT_FAILURE_REPLY_DELAY: Duration = Duration::from_secs(2);

/// Where the plugin writes its replies
#[async_trait]
pub trait Responder: Send + Sync {
    /// Send one plain text message
    async fn say(&self, text: &str) -> Result<()>;
    /// Send lines whose alignment must survive (monospace block)
    async fn say_block(&self, lines: &[String]) -> Result<()>;
}

/// How a linked image was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Results were posted; holds the call count after this one
    Annotated(u32),
    /// The link was not usable and nothing was posted
    Ignored,
    /// The download failed unexpectedly and the failure reply was posted
    Failed,
    /// The daily ceiling was reached and the image was not annotated
    QuotaExceeded,
}

/// First image-like URL in `text`, if any
#[must_use]
pub fn find_image_url(text: &str) -> Option<&str> {
    regex!(
        r"(?i)https?://(?:[a-zA-Z]|[0-9]|[$-_@.&+]|[!*(),]|%[0-9a-fA-F][0-9a-fA-F]|\.(?:jpe?g|png|gif|bmp))+"
    )
    .find(text)
    .map(|m| m.as_str())
}

/// Chat plugin that annotates linked images
pub struct VisionParser {
    images: Arc<dyn ImageSource>,
    annotator: Arc<dyn Annotator>,
    quota: QuotaTracker,
    daily_quota: u32,
    failure_reply_delay: Duration,
    // Held from the quota check until the increment
    quota_gate: Mutex<()>,
}

impl VisionParser {
    /// Create the plugin from its collaborators
    #[must_use]
    pub fn new(
        images: Arc<dyn ImageSource>,
        annotator: Arc<dyn Annotator>,
        quota: QuotaTracker,
    ) -> Self {
        Self {
            images,
            annotator,
            quota,
            daily_quota: DAILY_QUOTA,
            failure_reply_delay: DEFAULT_FAILURE_REPLY_DELAY,
            quota_gate: Mutex::new(()),
        }
    }

    /// Override the pause between the two halves of the failure reply
    #[must_use]
    pub const fn with_failure_reply_delay(mut self, delay: Duration) -> Self {
        self.failure_reply_delay = delay;
        self
    }

    /// Run the pipeline if `text` contains an image link
    ///
    /// # Errors
    ///
    /// See [`Self::handle_image_url`].
    pub async fn handle_message(
        &self,
        text: &str,
        responder: &dyn Responder,
    ) -> Result<Option<PipelineOutcome>> {
        match find_image_url(text) {
            Some(url) => self.handle_image_url(url, responder).await.map(Some),
            None => Ok(None),
        }
    }

    /// Download, annotate and report on the image at `url`
    ///
    /// # Errors
    ///
    /// Returns an error if the quota store fails, the annotation call fails,
    /// or a reply cannot be sent. Download failures are handled here.
    ///
    /// Downloads run concurrently, but only one image at a time goes through
    /// the quota check, annotation and increment.
    pub async fn handle_image_url(
        &self,
        url: &str,
        responder: &dyn Responder,
    ) -> Result<PipelineOutcome> {
        info!(url, "Got image url");

        let image = match self.images.fetch(url).await {
            Ok(image) => image,
            Err(e) if e.is_silent() => {
                warn!(url, error = %e, "Ignoring link");
                return Ok(PipelineOutcome::Ignored);
            }
            Err(e) => {
                error!(url, error = %e, "Image download failed");
                responder.say(ACK_REPLY).await?;
                tokio::time::sleep(self.failure_reply_delay).await;
                responder.say(FAILURE_REPLY).await?;
                return Ok(PipelineOutcome::Failed);
            }
        };

        let _gate = self.quota_gate.lock().await;
        let record = self.quota.check_quota().await?;
        if record.count >= self.daily_quota {
            info!(count = record.count, "Daily quota exhausted");
            responder.say(QUOTA_EXCEEDED_REPLY).await?;
            return Ok(PipelineOutcome::QuotaExceeded);
        }

        responder.say(ACK_REPLY).await?;
        let annotations = self
            .annotator
            .annotate(&image)
            .await
            .context("Vision API call failed")?;

        responder.say_block(&render_report(&annotations)).await?;
        let record = self.quota.increment_quota().await?;
        Ok(PipelineOutcome::Annotated(record.count))
    }

    /// Report today's usage
    ///
    /// # Errors
    ///
    /// Returns an error if the quota store fails or the reply cannot be sent.
    pub async fn quota(&self, responder: &dyn Responder) -> Result<()> {
        let record = self.quota.check_quota().await?;
        responder
            .say(&format!(
                "current quota is {} of {} for today.",
                record.count, self.daily_quota
            ))
            .await
    }

    /// Zero today's usage; callers must check privileges first
    ///
    /// # Errors
    ///
    /// Returns an error if the reply cannot be sent or the store fails.
    pub async fn reset_quota(&self, responder: &dyn Responder) -> Result<()> {
        responder.say(RESET_REPLY).await?;
        self.quota.reset_quota().await?;
        Ok(())
    }
}
