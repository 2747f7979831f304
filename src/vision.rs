//! Google Cloud Vision annotation client
//!
//! Sends one `images:annotate` request per image with label, face and
//! safe-search detection, authenticated through Application Default
//! Credentials.

use crate::config::MAX_RESULTS;
use async_trait::async_trait;
use gcp_auth::TokenProvider;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

const VISION_API_URL: &str = "https://vision.googleapis.com/v1/images:annotate";
const VISION_API_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-vision"];
const MAX_ERROR_BODY: usize = 500;

/// Errors returned by the annotation service
#[derive(Error, Debug)]
pub enum AnnotationError {
    /// Application Default Credentials could not produce a token
    #[error("authentication error: {0}")]
    Auth(String),
    /// The request did not reach the service
    #[error("network error: {0}")]
    Network(String),
    /// The service answered with a non-success status
    #[error("API error: {0}")]
    Api(String),
    /// The response body was not the expected JSON
    #[error("JSON error: {0}")]
    Json(String),
    /// The service rejected this particular image
    #[error("image error {code}: {message}")]
    Image {
        /// gRPC status code
        code: i32,
        /// Human-readable reason
        message: String,
    },
}

/// Interface for image annotation backends
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Annotator: Send + Sync {
    /// Annotate a base64-encoded image with labels, faces and safe-search
    async fn annotate(&self, image_base64: &str) -> Result<AnnotateImageResponse, AnnotationError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VisionRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Feature {
    #[serde(rename = "type")]
    feature_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_results: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct VisionResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

/// Annotations for a single image
///
/// Faces and safe-search results are kept as raw JSON maps: their keys are
/// what ends up in the chat reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnnotateImageResponse {
    /// One map per detected face (`joyLikelihood`, `boundingPoly`, ...)
    pub face_annotations: Option<Vec<Map<String, Value>>>,
    /// Safe-search category -> likelihood name
    pub safe_search_annotation: Option<Map<String, Value>>,
    /// Descriptive labels, most relevant first
    pub label_annotations: Option<Vec<LabelAnnotation>>,
    /// Set when the service failed on this image
    pub error: Option<ApiStatus>,
}

/// A descriptive tag for the image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelAnnotation {
    /// Human-readable label
    pub description: String,
    /// Confidence in `[0, 1]`
    pub score: Option<f32>,
    /// Knowledge Graph id
    pub mid: Option<String>,
}

/// Per-image error status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiStatus {
    /// gRPC status code
    pub code: i32,
    /// Error description
    pub message: String,
}

fn build_request(image_base64: &str) -> VisionRequest {
    VisionRequest {
        requests: vec![AnnotateImageRequest {
            image: ImageContent {
                content: image_base64.to_string(),
            },
            features: vec![
                Feature {
                    feature_type: "LABEL_DETECTION",
                    max_results: Some(MAX_RESULTS),
                },
                Feature {
                    feature_type: "FACE_DETECTION",
                    max_results: Some(MAX_RESULTS),
                },
                Feature {
                    feature_type: "SAFE_SEARCH_DETECTION",
                    max_results: None,
                },
            ],
        }],
    }
}

fn first_response(response: VisionResponse) -> Result<AnnotateImageResponse, AnnotationError> {
    let annotations = response.responses.into_iter().next().unwrap_or_default();
    match annotations.error {
        Some(status) => Err(AnnotationError::Image {
            code: status.code,
            message: status.message,
        }),
        None => Ok(annotations),
    }
}

fn describe_http_error(status: reqwest::StatusCode, body: &str) -> String {
    let trimmed = body.trim_start();
    if trimmed.starts_with("<!DOCTYPE") || trimmed.starts_with("<html") {
        return format!("{status} (Server returned HTML error page)");
    }
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or_default();
        return format!("{status} - {}... (truncated)", &body[..cut]);
    }
    format!("{status} - {body}")
}

/// Vision API client authenticated with Application Default Credentials
pub struct GoogleVisionClient {
    http_client: HttpClient,
    token_provider: OnceCell<Arc<dyn TokenProvider>>,
}

impl Default for GoogleVisionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GoogleVisionClient {
    /// Create a client; credentials are resolved on first use
    #[must_use]
    pub fn new() -> Self {
        Self {
            http_client: HttpClient::new(),
            token_provider: OnceCell::new(),
        }
    }

    async fn access_token(&self) -> Result<Arc<gcp_auth::Token>, AnnotationError> {
        let provider = self
            .token_provider
            .get_or_try_init(|| async {
                debug!(
                    credentials_file = ?std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok(),
                    "Resolving application default credentials"
                );
                gcp_auth::provider().await
            })
            .await
            .map_err(|e| AnnotationError::Auth(e.to_string()))?;

        provider
            .token(VISION_API_SCOPES)
            .await
            .map_err(|e| AnnotationError::Auth(e.to_string()))
    }
}

#[async_trait]
impl Annotator for GoogleVisionClient {
    async fn annotate(&self, image_base64: &str) -> Result<AnnotateImageResponse, AnnotationError> {
        let token = self.access_token().await?;
        let request = build_request(image_base64);
        let start = Instant::now();

        let response = self
            .http_client
            .post(VISION_API_URL)
            .bearer_auth(token.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| AnnotationError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = describe_http_error(status, &body);
            error!(%status, "Vision API request failed");
            return Err(AnnotationError::Api(message));
        }

        let parsed: VisionResponse = response
            .json()
            .await
            .map_err(|e| AnnotationError::Json(e.to_string()))?;
        let annotations = first_response(parsed)?;

        info!(
            faces = annotations.face_annotations.as_ref().map_or(0, Vec::len),
            labels = annotations.label_annotations.as_ref().map_or(0, Vec::len),
            elapsed_ms = start.elapsed().as_millis(),
            "Image annotated"
        );
        Ok(annotations)
    }
}
