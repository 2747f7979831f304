//! Image download and preparation
//!
//! Downloads a linked image, checks that it is an image of acceptable size,
//! shrinks it if its longest side exceeds [`MAX_IMAGE_SIZE`] and returns it as
//! base64-encoded JPEG, ready to be embedded in an annotation request.

use crate::config::{FETCH_TIMEOUT_SECS, MAX_DOWNLOAD_SIZE, MAX_IMAGE_SIZE};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::StreamExt;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client as HttpClient;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Reasons a link could not be turned into an annotation payload
#[derive(Error, Debug)]
pub enum FetchError {
    /// The server did not declare an image content type
    #[error("not an image file (content type: {0:?})")]
    NotAnImage(String),
    /// The image exceeds the download limit
    #[error("image file too big ({0} bytes)")]
    TooLarge(u64),
    /// The host could not be reached in time
    #[error("connection error: {0}")]
    Connection(#[source] reqwest::Error),
    /// Anything else: bad URL, undecodable bytes, encoder failure
    #[error("failed to fetch image: {0}")]
    Unknown(String),
}

impl FetchError {
    /// Whether the failure means "not applicable input" rather than a fault
    /// worth telling the chat about
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        matches!(
            self,
            Self::NotAnImage(_) | Self::TooLarge(_) | Self::Connection(_)
        )
    }

    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Self::Connection(e)
        } else {
            Self::Unknown(e.to_string())
        }
    }
}

/// Anything that can turn a URL into a base64 image payload
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Fetch `url` and return the prepared image as base64 JPEG
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// HTTP-backed [`ImageSource`]
pub struct ImageFetcher {
    http_client: HttpClient,
    max_download_size: u64,
    max_image_size: u32,
}

impl ImageFetcher {
    /// Create a fetcher with the default limits
    ///
    /// TLS certificates of the image host are not verified.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_limits(MAX_DOWNLOAD_SIZE, MAX_IMAGE_SIZE)
    }

    /// Create a fetcher with custom download (bytes) and dimension (pixels) limits
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_limits(max_download_size: u64, max_image_size: u32) -> Result<Self, reqwest::Error> {
        let http_client = HttpClient::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http_client,
            max_download_size,
            max_image_size,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(FetchError::from_transport)?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.contains("image") {
            return Err(FetchError::NotAnImage(content_type));
        }

        let declared = response.content_length();
        if let Some(len) = declared.filter(|len| *len > self.max_download_size) {
            return Err(FetchError::TooLarge(len));
        }

        let capacity = declared.and_then(|len| usize::try_from(len).ok());
        let mut body = Vec::with_capacity(capacity.unwrap_or_default());
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(FetchError::from_transport)?;
            let received = (body.len() + chunk.len()) as u64;
            // Content-Length may be absent or wrong
            if received > self.max_download_size {
                return Err(FetchError::TooLarge(received));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url, content_type = %content_type, bytes = body.len(), "Downloaded image");
        Ok(body)
    }
}

#[async_trait]
impl ImageSource for ImageFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let body = self.download(url).await?;
        let cap = self.max_image_size;

        // Decoding and resampling are CPU-bound
        tokio::task::spawn_blocking(move || encode_for_annotation(&body, cap))
            .await
            .map_err(|e| FetchError::Unknown(e.to_string()))?
    }
}

/// Decode `bytes`, shrink to `cap` if needed and return base64 JPEG
///
/// # Errors
///
/// Returns [`FetchError::Unknown`] if the bytes are not a decodable image or
/// JPEG encoding fails.
pub fn encode_for_annotation(bytes: &[u8], cap: u32) -> Result<String, FetchError> {
    let image = image::load_from_memory(bytes).map_err(|e| FetchError::Unknown(e.to_string()))?;
    let (width, height) = image.dimensions();
    let resized = resize_to_fit(image, cap);
    if resized.dimensions() != (width, height) {
        info!(
            from = ?(width, height),
            to = ?resized.dimensions(),
            "Downsampled image"
        );
    }
    let jpeg = to_jpeg(&resized)?;
    Ok(BASE64.encode(jpeg))
}

/// Target dimensions so that the longest side is at most `cap`
///
/// Both sides are scaled by the same factor; the shorter side is rounded to
/// the nearest pixel and never drops below one.
#[must_use]
pub fn fit_dimensions(width: u32, height: u32, cap: u32) -> (u32, u32) {
    let larger = width.max(height);
    if larger <= cap {
        return (width, height);
    }

    let scale = f64::from(cap) / f64::from(larger);
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, cap);
    if width >= height {
        (cap, scaled(height))
    } else {
        (scaled(width), cap)
    }
}

/// Shrink `image` so its longest side is at most `cap`, preserving aspect ratio
#[must_use]
pub fn resize_to_fit(image: DynamicImage, cap: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = fit_dimensions(width, height, cap);
    if (new_width, new_height) == (width, height) {
        return image;
    }
    image.resize_exact(new_width, new_height, FilterType::Lanczos3)
}

fn to_jpeg(image: &DynamicImage) -> Result<Vec<u8>, FetchError> {
    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| FetchError::Unknown(e.to_string()))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn png_bytes(width: u32, height: u32) -> Result<Vec<u8>, image::ImageError> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 40, 40])));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }

    fn decode_payload(payload: &str) -> Result<DynamicImage, Box<dyn std::error::Error>> {
        let bytes = BASE64.decode(payload)?;
        assert_eq!(image::guess_format(&bytes)?, ImageFormat::Jpeg);
        Ok(image::load_from_memory(&bytes)?)
    }

    async fn serve(body: Vec<u8>, mime: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/picture"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, mime))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_fit_dimensions_small_images_untouched() {
        assert_eq!(fit_dimensions(800, 600, 1600), (800, 600));
        assert_eq!(fit_dimensions(1600, 900, 1600), (1600, 900));
        assert_eq!(fit_dimensions(1600, 1600, 1600), (1600, 1600));
    }

    #[test]
    fn test_fit_dimensions_landscape_and_portrait() {
        assert_eq!(fit_dimensions(3200, 2400, 1600), (1600, 1200));
        assert_eq!(fit_dimensions(2400, 3200, 1600), (1200, 1600));
        // 1000 * 1600 / 3000 = 533.33
        assert_eq!(fit_dimensions(3000, 1000, 1600), (1600, 533));
        // 1001 * 1600 / 3000 = 533.87
        assert_eq!(fit_dimensions(1001, 3000, 1600), (534, 1600));
    }

    #[test]
    fn test_fit_dimensions_never_collapses_to_zero() {
        assert_eq!(fit_dimensions(100_000, 1, 1600), (1600, 1));
    }

    #[test]
    fn test_resize_to_fit_is_noop_below_cap() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(40, 30));
        assert_eq!(resize_to_fit(image, 50).dimensions(), (40, 30));
    }

    #[test]
    fn test_resize_to_fit_shrinks_longest_side() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(300, 100));
        assert_eq!(resize_to_fit(image, 60).dimensions(), (60, 20));
    }

    #[test]
    fn test_encode_for_annotation_drops_alpha() -> TestResult {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([1, 2, 3, 128])));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png)?;

        let payload = encode_for_annotation(&out.into_inner(), 1600)?;
        assert_eq!(decode_payload(&payload)?.dimensions(), (10, 10));
        Ok(())
    }

    #[test]
    fn test_encode_for_annotation_rejects_garbage() {
        let result = encode_for_annotation(b"definitely not an image", 1600);
        assert!(matches!(result, Err(FetchError::Unknown(_))));
    }

    #[tokio::test]
    async fn test_fetch_returns_base64_jpeg() -> TestResult {
        let server = serve(png_bytes(64, 48)?, "image/png").await;
        let fetcher = ImageFetcher::new()?;

        let payload = fetcher.fetch(&format!("{}/picture", server.uri())).await?;
        assert_eq!(decode_payload(&payload)?.dimensions(), (64, 48));
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_downsamples_oversized_image() -> TestResult {
        let server = serve(png_bytes(400, 100)?, "image/png").await;
        let fetcher = ImageFetcher::with_limits(MAX_DOWNLOAD_SIZE, 200)?;

        let payload = fetcher.fetch(&format!("{}/picture", server.uri())).await?;
        assert_eq!(decode_payload(&payload)?.dimensions(), (200, 50));
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_image_content_type() -> TestResult {
        let server = serve(b"<html></html>".to_vec(), "text/html").await;
        let fetcher = ImageFetcher::new()?;

        let result = fetcher.fetch(&format!("{}/picture", server.uri())).await;
        match result {
            Err(e @ FetchError::NotAnImage(_)) => assert!(e.is_silent()),
            other => panic!("expected NotAnImage, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_rejects_oversized_download() -> TestResult {
        let server = serve(vec![0_u8; 2048], "image/jpeg").await;
        let fetcher = ImageFetcher::with_limits(1024, MAX_IMAGE_SIZE)?;

        let result = fetcher.fetch(&format!("{}/picture", server.uri())).await;
        assert!(matches!(result, Err(FetchError::TooLarge(2048))));
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_undecodable_image_is_unknown_failure() -> TestResult {
        let server = serve(b"GIF89a but not really".to_vec(), "image/gif").await;
        let fetcher = ImageFetcher::new()?;

        let result = fetcher.fetch(&format!("{}/picture", server.uri())).await;
        match result {
            Err(e @ FetchError::Unknown(_)) => assert!(!e.is_silent()),
            other => panic!("expected Unknown, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_unreachable_host_is_connection_error() -> TestResult {
        // Grab a free port, then close it so nothing is listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let fetcher = ImageFetcher::new()?;
        let result = fetcher.fetch(&format!("http://127.0.0.1:{port}/cat.jpg")).await;
        assert!(matches!(result, Err(FetchError::Connection(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_invalid_url_is_unknown_failure() -> TestResult {
        let fetcher = ImageFetcher::new()?;
        let result = fetcher.fetch("http://").await;
        assert!(matches!(result, Err(FetchError::Unknown(_))));
        Ok(())
    }

    /// Serve one chunked `image/jpeg` response without a Content-Length
    async fn serve_chunked(chunks: usize, chunk_size: usize) -> std::io::Result<String> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0_u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }

            let mut response = b"HTTP/1.1 200 OK\r\n\
                Content-Type: image/jpeg\r\n\
                Transfer-Encoding: chunked\r\n\r\n"
                .to_vec();
            for _ in 0..chunks {
                response.extend_from_slice(format!("{chunk_size:x}\r\n").as_bytes());
                response.resize(response.len() + chunk_size, 0xFF);
                response.extend_from_slice(b"\r\n");
            }
            response.extend_from_slice(b"0\r\n\r\n");
            // The client hangs up once it has seen too much
            let _ = socket.write_all(&response).await;
        });
        Ok(format!("http://{addr}/picture"))
    }

    #[tokio::test]
    async fn test_fetch_caps_body_without_content_length() -> TestResult {
        let url = serve_chunked(4, 1024).await?;
        let fetcher = ImageFetcher::with_limits(2000, MAX_IMAGE_SIZE)?;

        match fetcher.fetch(&url).await {
            Err(e @ FetchError::TooLarge(received)) => {
                assert!(received > 2000 && received <= 4096, "{received}");
                assert!(e.is_silent());
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
        Ok(())
    }
}
