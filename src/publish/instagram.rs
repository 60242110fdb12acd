//! Instagram Graph API publisher.
//!
//! Publishing is a two-step flow:
//!
//! 1. Create a media container (`POST /{ig-user-id}/media`). Carousels create
//!    one child container per item, then a parent container listing them.
//!    Video containers are polled until the upload has been processed.
//! 2. Publish the container (`POST /{ig-user-id}/media_publish`).
//!
//! An attempt is planned against `InstagramConfig::publish_budget`: no new
//! container request or status check starts once only two request timeouts
//! of the budget remain, which leaves room for the last in-flight request and
//! `media_publish`. A slow video therefore fails with `PublishError::Timeout`
//! before `media_publish` is sent, never during it.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::token::{InstagramCredentials, TokenProvider};
use super::{PublishReceipt, PublishRequest, Publisher};
use crate::agendamento::{MediaKind, MediaRef, Platform, PostPayload};
use crate::error::PublishError;

/// Default Graph API base URL.
pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v19.0";

/// Maximum number of items in a carousel.
pub const MAX_CAROUSEL_ITEMS: usize = 10;

/// Maximum caption length accepted by Instagram.
pub const MAX_CAPTION_CHARS: usize = 2200;

/// Header carrying the idempotency key of the attempt.
const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// Configuration of the Instagram publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct InstagramConfig {
    /// Graph API base URL, without trailing slash.
    pub api_base: String,
    /// Timeout of each HTTP request.
    pub request_timeout: Duration,
    /// Delay between video container status checks.
    pub container_poll_interval: Duration,
    /// Status checks before a video container is considered stuck.
    pub container_poll_attempts: u32,
    /// Time one publish attempt may take, every request included.
    pub publish_budget: Duration,
}

impl Default for InstagramConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout: Duration::from_secs(30),
            container_poll_interval: Duration::from_secs(2),
            container_poll_attempts: 30,
            publish_budget: Duration::from_secs(150),
        }
    }
}

impl InstagramConfig {
    /// Reads `INSTAGRAM_API_BASE`, keeping the other defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base) = env::var("INSTAGRAM_API_BASE") {
            if !base.trim().is_empty() {
                config.api_base = base.trim().trim_end_matches('/').to_string();
            }
        }
        config
    }

    /// Sets the API base URL.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the video container polling cadence.
    pub fn with_container_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.container_poll_interval = interval;
        self.container_poll_attempts = attempts.max(1);
        self
    }

    /// Sets the time one attempt may take.
    ///
    /// The request timeout is lowered to a quarter of the budget when it is
    /// longer, so polling always keeps half of the budget.
    pub fn with_publish_budget(mut self, budget: Duration) -> Self {
        self.publish_budget = budget;
        self.request_timeout = self.request_timeout.min(budget / 4);
        self
    }

    /// Part of the budget during which container requests and status checks
    /// may start.
    pub fn polling_window(&self) -> Duration {
        self.publish_budget.saturating_sub(self.request_timeout * 2)
    }
}

/// Body of a container creation request.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
struct ContainerRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_carousel_item: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    children: Option<String>,
    access_token: String,
}

impl ContainerRequest {
    /// Container for a single-media post.
    fn single(media: &MediaRef, caption: &str, token: &str) -> Self {
        let mut request = Self::for_media(media, token);
        if media.kind == MediaKind::Video {
            request.media_type = Some("REELS");
        }
        request.caption = non_empty(caption);
        request
    }

    /// Child container of a carousel.
    fn carousel_item(media: &MediaRef, token: &str) -> Self {
        let mut request = Self::for_media(media, token);
        if media.kind == MediaKind::Video {
            request.media_type = Some("VIDEO");
        }
        request.is_carousel_item = Some(true);
        request
    }

    /// Parent container of a carousel.
    fn carousel(children: &[String], caption: &str, token: &str) -> Self {
        Self {
            media_type: Some("CAROUSEL"),
            children: Some(children.join(",")),
            caption: non_empty(caption),
            access_token: token.to_string(),
            ..Default::default()
        }
    }

    fn for_media(media: &MediaRef, token: &str) -> Self {
        let mut request = Self {
            access_token: token.to_string(),
            ..Default::default()
        };
        match media.kind {
            MediaKind::Image => request.image_url = Some(media.url.clone()),
            MediaKind::Video => request.video_url = Some(media.url.clone()),
        }
        request
    }
}

fn non_empty(caption: &str) -> Option<String> {
    (!caption.is_empty()).then(|| caption.to_string())
}

#[derive(Debug, Serialize)]
struct PublishContainerRequest<'a> {
    creation_id: &'a str,
    access_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    #[serde(default)]
    status_code: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorResponse {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

/// Builds the error for a non-success response body.
fn api_error(status: u16, body: &str) -> PublishError {
    match serde_json::from_str::<GraphErrorResponse>(body) {
        Ok(parsed) => PublishError::Api {
            status,
            code: parsed.error.code,
            message: parsed.error.message,
        },
        Err(_) => PublishError::Api {
            status,
            code: None,
            message: body.to_string(),
        },
    }
}

/// Checks the payload against Instagram's publishing rules.
pub fn validate_payload(payload: &PostPayload) -> Result<(), PublishError> {
    if payload.media.is_empty() {
        return Err(PublishError::InvalidPayload(
            "Instagram posts need at least one media item".to_string(),
        ));
    }
    if payload.media.len() > MAX_CAROUSEL_ITEMS {
        return Err(PublishError::InvalidPayload(format!(
            "carousel has {} items, at most {} are allowed",
            payload.media.len(),
            MAX_CAROUSEL_ITEMS
        )));
    }
    if payload.caption.chars().count() > MAX_CAPTION_CHARS {
        return Err(PublishError::InvalidPayload(format!(
            "caption exceeds {} characters",
            MAX_CAPTION_CHARS
        )));
    }
    if let Some(media) = payload.media.iter().find(|m| m.url.trim().is_empty()) {
        return Err(PublishError::InvalidPayload(format!(
            "{:?} media item has an empty url",
            media.kind
        )));
    }
    Ok(())
}

/// Publisher for Instagram business accounts.
pub struct InstagramPublisher {
    config: InstagramConfig,
    tokens: Arc<dyn TokenProvider>,
    http_client: Client,
}

impl InstagramPublisher {
    /// Creates a publisher.
    ///
    /// # Errors
    ///
    /// Returns `PublishError::Http` if the HTTP client cannot be built.
    pub fn new(config: InstagramConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self, PublishError> {
        let http_client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            config,
            tokens,
            http_client,
        })
    }

    /// Creates a publisher configured from the environment whose attempts
    /// fit in `publish_budget`.
    pub fn from_env(
        tokens: Arc<dyn TokenProvider>,
        publish_budget: Duration,
    ) -> Result<Self, PublishError> {
        Self::new(
            InstagramConfig::from_env().with_publish_budget(publish_budget),
            tokens,
        )
    }

    /// Returns the configuration.
    pub fn config(&self) -> &InstagramConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        idempotency_key: &str,
    ) -> Result<T, PublishError> {
        let response: Response = request
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(api_error(status.as_u16(), &body));
        }

        Ok(response.json::<T>().await?)
    }

    async fn create_container(
        &self,
        creds: &InstagramCredentials,
        body: &ContainerRequest,
        idempotency_key: &str,
    ) -> Result<String, PublishError> {
        let request = self
            .http_client
            .post(self.url(&format!("{}/media", creds.user_id)))
            .json(body);
        let created: IdResponse = self.send(request, idempotency_key).await?;
        debug!(container_id = %created.id, "Created media container");
        Ok(created.id)
    }

    fn budget_spent(&self) -> PublishError {
        warn!(
            budget_secs = self.config.publish_budget.as_secs_f64(),
            "Publish budget spent before the container was ready"
        );
        PublishError::Timeout(self.config.publish_budget)
    }

    /// Fails with `Timeout` once the polling window has closed.
    fn ensure_window_open(&self, window_closes: Instant) -> Result<(), PublishError> {
        if Instant::now() >= window_closes {
            return Err(self.budget_spent());
        }
        Ok(())
    }

    /// Waits until a video container has been processed.
    async fn wait_until_ready(
        &self,
        creds: &InstagramCredentials,
        container_id: &str,
        idempotency_key: &str,
        window_closes: Instant,
    ) -> Result<(), PublishError> {
        let url = format!(
            "{}?fields=status_code,status&access_token={}",
            self.url(container_id),
            urlencoding::encode(&creds.access_token)
        );

        for _ in 0..self.config.container_poll_attempts {
            let status: ContainerStatus = self
                .send(self.http_client.get(&url), idempotency_key)
                .await?;

            match status.status_code.as_deref() {
                Some("FINISHED") | Some("PUBLISHED") => return Ok(()),
                Some("ERROR") | Some("EXPIRED") => {
                    return Err(PublishError::Api {
                        status: 200,
                        code: None,
                        message: format!(
                            "media container {} failed processing: {}",
                            container_id,
                            status.status.unwrap_or_else(|| "no details".to_string())
                        ),
                    });
                }
                // The next check would start after the window closes.
                _ if Instant::now() + self.config.container_poll_interval >= window_closes => {
                    return Err(self.budget_spent());
                }
                _ => tokio::time::sleep(self.config.container_poll_interval).await,
            }
        }

        Err(PublishError::Timeout(
            self.config.container_poll_interval * self.config.container_poll_attempts,
        ))
    }

    async fn publish_container(
        &self,
        creds: &InstagramCredentials,
        container_id: &str,
        idempotency_key: &str,
    ) -> Result<String, PublishError> {
        let request = self
            .http_client
            .post(self.url(&format!("{}/media_publish", creds.user_id)))
            .json(&PublishContainerRequest {
                creation_id: container_id,
                access_token: &creds.access_token,
            });
        let published: IdResponse = self.send(request, idempotency_key).await?;
        Ok(published.id)
    }

    /// Creates the container to publish for `payload`.
    async fn build_container(
        &self,
        creds: &InstagramCredentials,
        payload: &PostPayload,
        idempotency_key: &str,
        window_closes: Instant,
    ) -> Result<String, PublishError> {
        if let [media] = payload.media.as_slice() {
            let body = ContainerRequest::single(media, &payload.caption, &creds.access_token);
            let id = self.create_container(creds, &body, idempotency_key).await?;
            if media.kind == MediaKind::Video {
                self.wait_until_ready(creds, &id, idempotency_key, window_closes)
                    .await?;
            }
            return Ok(id);
        }

        let mut children = Vec::with_capacity(payload.media.len());
        for media in &payload.media {
            self.ensure_window_open(window_closes)?;
            let body = ContainerRequest::carousel_item(media, &creds.access_token);
            let id = self.create_container(creds, &body, idempotency_key).await?;
            if media.kind == MediaKind::Video {
                self.wait_until_ready(creds, &id, idempotency_key, window_closes)
                    .await?;
            }
            children.push(id);
        }

        self.ensure_window_open(window_closes)?;
        let body = ContainerRequest::carousel(&children, &payload.caption, &creds.access_token);
        self.create_container(creds, &body, idempotency_key).await
    }
}

#[async_trait]
impl Publisher for InstagramPublisher {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        validate_payload(&request.payload)?;
        let window_closes = Instant::now() + self.config.polling_window();
        let creds = self.tokens.credentials().await?;

        let container_id = self
            .build_container(&creds, &request.payload, &request.idempotency_key, window_closes)
            .await?;
        let post_id = self
            .publish_container(&creds, &container_id, &request.idempotency_key)
            .await?;

        info!(
            agendamento_id = %request.agendamento_id,
            attempt = request.attempt,
            external_post_id = %post_id,
            "Published to Instagram"
        );

        Ok(PublishReceipt {
            external_post_id: post_id,
        })
    }
}
