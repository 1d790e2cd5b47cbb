//! Image Provider Abstraction
//!
//! Boundary to the external image-generation service. The pipeline treats the
//! provider as slow and unreliable: each call is one request, failures come back
//! as [`PipelineError`] values, and retry policy lives in the engine.

use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// An image attached to a request for consistency.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub label: String,
    pub bytes: Vec<u8>,
}

/// One image-generation request.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub reference_images: Vec<ReferenceImage>,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reference_images: Vec::new(),
        }
    }

    pub fn with_reference(mut self, label: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.reference_images.push(ReferenceImage {
            label: label.into(),
            bytes,
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub bytes: Vec<u8>,
    pub model: String,
}

/// Image provider client trait
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Generate one image.
    async fn generate(&self, request: ImageRequest) -> Result<ImageResponse, PipelineError>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// OpenAI images API.
    #[serde(rename = "openai")]
    OpenAI,
    /// Any server exposing the same endpoints.
    LocalCustom,
}

/// Provider configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_type")]
    pub provider_type: ProviderType,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_type() -> ProviderType {
    ProviderType::OpenAI
}

fn default_model() -> String {
    "gpt-image-1".to_string()
}

fn default_size() -> String {
    "1024x1024".to_string()
}

fn default_timeout_secs() -> u64 {
    180
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: default_provider_type(),
            model: default_model(),
            api_key: None,
            endpoint: None,
            size: default_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("Model name cannot be empty".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than zero".to_string());
        }
        match self.provider_type {
            ProviderType::OpenAI => {
                if self.api_key.as_deref().map(str::is_empty).unwrap_or(true) {
                    return Err("OpenAI provider requires an API key".to_string());
                }
            }
            ProviderType::LocalCustom => {
                if self.endpoint.as_deref().map(str::is_empty).unwrap_or(true) {
                    return Err("Local provider requires an endpoint".to_string());
                }
            }
        }
        Ok(())
    }

    pub fn base_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string()
    }
}

/// Build the configured provider.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn ImageProvider>, PipelineError> {
    config
        .validate()
        .map_err(PipelineError::ProviderNotConfigured)?;
    Ok(Arc::new(HttpImageProvider::new(config.clone())?))
}

#[derive(Serialize)]
struct GenerationRequestBody<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    response_format: &'a str,
}

#[derive(Deserialize)]
struct ImagesResponse {
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    url: Option<String>,
}

fn map_http_error(error: reqwest::Error) -> PipelineError {
    if error.is_timeout() {
        PipelineError::ProviderTimeout(format!("Request timeout: {}", error))
    } else if let Some(status) = error.status() {
        map_status(status.as_u16(), error.to_string())
    } else if error.is_connect() {
        PipelineError::ProviderRequestFailed(format!("Connection error: {}", error))
    } else {
        PipelineError::ProviderError(format!("HTTP error: {}", error))
    }
}

fn map_status(status: u16, detail: String) -> PipelineError {
    match status {
        400 => PipelineError::ProviderRejected(detail),
        401 | 403 => PipelineError::ProviderAuthFailed(detail),
        408 | 504 => PipelineError::ProviderTimeout(detail),
        429 => PipelineError::ProviderRateLimit(detail),
        _ => PipelineError::ProviderRequestFailed(format!(
            "Request failed with status {}: {}",
            status, detail
        )),
    }
}

const PROVIDER_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// OpenAI-compatible images client. Requests without references go to
/// `/images/generations`; requests with references go to `/images/edits` as
/// multipart uploads. Images are fetched from the returned URL.
pub struct HttpImageProvider {
    client: Client,
    config: ProviderConfig,
    base_url: String,
}

impl HttpImageProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .connect_timeout(PROVIDER_HTTP_CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::ProviderError(format!("Failed to create HTTP client: {}", e)))?;
        let base_url = config.base_url();
        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }

    async fn request_generation(&self, request: &ImageRequest) -> Result<reqwest::Response, PipelineError> {
        let body = GenerationRequestBody {
            model: &self.config.model,
            prompt: &request.prompt,
            n: 1,
            size: &self.config.size,
            response_format: "url",
        };
        let url = format!("{}/images/generations", self.base_url);
        self.authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(map_http_error)
    }

    async fn request_edit(&self, request: &ImageRequest) -> Result<reqwest::Response, PipelineError> {
        let mut form = Form::new()
            .text("model", self.config.model.clone())
            .text("prompt", request.prompt.clone())
            .text("n", "1")
            .text("size", self.config.size.clone())
            .text("response_format", "url");
        for (index, reference) in request.reference_images.iter().enumerate() {
            let part = Part::bytes(reference.bytes.clone())
                .file_name(format!("reference-{}.png", index))
                .mime_str("image/png")
                .map_err(|e| PipelineError::ProviderError(e.to_string()))?;
            form = form.part("image[]", part);
        }
        let url = format!("{}/images/edits", self.base_url);
        self.authorize(self.client.post(&url))
            .multipart(form)
            .send()
            .await
            .map_err(map_http_error)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self.client.get(url).send().await.map_err(map_http_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(map_status(status, format!("image download failed: {}", url)));
        }
        let bytes = response.bytes().await.map_err(map_http_error)?;
        if bytes.is_empty() {
            return Err(PipelineError::MalformedResponse("empty image body".to_string()));
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageProvider for HttpImageProvider {
    async fn generate(&self, request: ImageRequest) -> Result<ImageResponse, PipelineError> {
        debug!(
            provider = self.provider_name(),
            model = %self.config.model,
            references = request.reference_images.len(),
            prompt_chars = request.prompt.chars().count(),
            "Sending image request"
        );
        let response = if request.reference_images.is_empty() {
            self.request_generation(&request).await?
        } else {
            self.request_edit(&request).await?
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status(status, error_text));
        }

        let parsed: ImagesResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::MalformedResponse(format!("Failed to parse response: {}", e)))?;
        let url = parsed
            .data
            .into_iter()
            .find_map(|d| d.url)
            .ok_or_else(|| PipelineError::MalformedResponse("No image URL in response".to_string()))?;

        let bytes = self.download(&url).await?;
        Ok(ImageResponse {
            bytes,
            model: self.config.model.clone(),
        })
    }

    fn provider_name(&self) -> &str {
        match self.config.provider_type {
            ProviderType::OpenAI => "openai",
            ProviderType::LocalCustom => "local",
        }
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
