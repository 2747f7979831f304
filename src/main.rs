use dotenvy::dotenv;
use oxide_vision::bot::runner::run_bot;
use oxide_vision::config::Settings;
use oxide_vision::fetcher::ImageFetcher;
use oxide_vision::plugin::VisionParser;
use oxide_vision::quota::QuotaTracker;
use oxide_vision::storage::{self, KeyValueStore};
use oxide_vision::vision::GoogleVisionClient;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    token_url: Regex,
    token_bare: Regex,
    r2_key_id: Regex,
    r2_secret: Regex,
    bearer: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token_url: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token_bare: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            r2_key_id: Regex::new(r"R2_ACCESS_KEY_ID=[^\s&]+")?,
            r2_secret: Regex::new(r"R2_SECRET_ACCESS_KEY=[^\s&]+")?,
            bearer: Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9._~+/-]+=*")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let output = self
            .token_url
            .replace_all(input, "$1[TELEGRAM_TOKEN]$3");
        let output = self.token_bare.replace_all(&output, "[TELEGRAM_TOKEN]");
        let output = self
            .r2_key_id
            .replace_all(&output, "R2_ACCESS_KEY_ID=[MASKED]");
        let output = self
            .r2_secret
            .replace_all(&output, "R2_SECRET_ACCESS_KEY=[MASKED]");
        self.bearer.replace_all(&output, "${1}[MASKED]").into_owned()
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length; the redacted text may differ in size
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting Oxide Vision bot...");

    let settings = init_settings();
    let store = init_storage(&settings).await;

    let fetcher = ImageFetcher::new().map_err(|e| {
        error!("Failed to build image download client: {}", e);
        e
    })?;
    let parser = VisionParser::new(
        Arc::new(fetcher),
        Arc::new(GoogleVisionClient::new()),
        QuotaTracker::new(store),
    )
    .with_failure_reply_delay(settings.failure_reply_delay());
    info!("Vision plugin initialized.");

    run_bot(settings, Arc::new(parser)).await;
    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

async fn init_storage(settings: &Settings) -> Arc<dyn KeyValueStore> {
    match storage::from_settings(settings).await {
        Ok(s) => {
            info!(backend = ?settings.storage_backend, "Storage initialized.");
            if s.check_connection().await.is_err() {
                error!("Storage connection check returned error.");
            }
            s
        }
        Err(e) => {
            error!("Failed to initialize storage: {}", e);
            std::process::exit(1);
        }
    }
}
