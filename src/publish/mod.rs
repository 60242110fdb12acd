//! Social platform publishing.
//!
//! A `Publisher` turns a `PublishRequest` into a live post and returns the
//! platform's id for it. Workers look publishers up by platform in a
//! `PublisherRegistry`.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use agendamento_publisher::publish::{InstagramPublisher, PublisherRegistry, StaticTokenProvider};
//!
//! let tokens = Arc::new(StaticTokenProvider::from_env()?);
//! let instagram = InstagramPublisher::from_env(tokens, Duration::from_secs(160))?;
//! let registry = PublisherRegistry::new().with_publisher(Arc::new(instagram));
//! ```

pub mod instagram;
pub mod token;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agendamento::{Platform, PostPayload};
use crate::scheduler::job::PublishTask;

pub use crate::error::PublishError;
pub use instagram::{InstagramConfig, InstagramPublisher};
pub use token::{InstagramCredentials, StaticTokenProvider, TokenProvider};

/// One publish attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub agendamento_id: Uuid,
    pub platform: Platform,
    pub payload: PostPayload,
    /// Stable across attempts for the same agendamento.
    pub idempotency_key: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl PublishRequest {
    /// Builds the request for a queued task.
    pub fn from_task(task: &PublishTask, attempt: u32) -> Self {
        Self {
            agendamento_id: task.agendamento_id,
            platform: task.platform,
            payload: task.payload.clone(),
            idempotency_key: task.idempotency_key(),
            attempt,
        }
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Id of the post on the platform.
    pub external_post_id: String,
}

/// Publishes posts to one platform.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Platform this publisher serves.
    fn platform(&self) -> Platform;

    /// Publishes the post described by `request`.
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError>;
}

/// Publishers keyed by platform.
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    publishers: HashMap<Platform, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a publisher, replacing any previous one for its platform.
    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(publisher.platform(), publisher);
    }

    /// Builder form of `register`.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.register(publisher);
        self
    }

    /// Returns the publisher for `platform`.
    pub fn get(&self, platform: Platform) -> Result<Arc<dyn Publisher>, PublishError> {
        self.publishers
            .get(&platform)
            .cloned()
            .ok_or_else(|| PublishError::UnsupportedPlatform(platform.to_string()))
    }

    /// Publishes through the publisher registered for the request's platform.
    pub async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        self.get(request.platform)?.publish(request).await
    }

    /// Registered platforms.
    pub fn platforms(&self) -> Vec<Platform> {
        self.publishers.keys().copied().collect()
    }
}

impl std::fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agendamento::MediaRef;

    struct FixedPublisher;

    #[async_trait]
    impl Publisher for FixedPublisher {
        fn platform(&self) -> Platform {
            Platform::Instagram
        }

        async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
            Ok(PublishReceipt {
                external_post_id: format!("post-{}", request.attempt),
            })
        }
    }

    fn task() -> PublishTask {
        PublishTask {
            agendamento_id: Uuid::new_v4(),
            platform: Platform::Instagram,
            payload: PostPayload::new("hi").with_media(MediaRef::image("https://x/1.jpg")),
        }
    }

    #[test]
    fn test_request_carries_idempotency_key() {
        let task = task();
        let first = PublishRequest::from_task(&task, 1);
        let second = PublishRequest::from_task(&task, 2);

        assert_eq!(first.idempotency_key, second.idempotency_key);
        assert_eq!(first.idempotency_key, task.idempotency_key());
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_platform() {
        let registry = PublisherRegistry::new().with_publisher(Arc::new(FixedPublisher));
        let receipt = registry
            .publish(&PublishRequest::from_task(&task(), 3))
            .await
            .expect("publish");
        assert_eq!(receipt.external_post_id, "post-3");
        assert_eq!(registry.platforms(), vec![Platform::Instagram]);
    }

    #[tokio::test]
    async fn test_empty_registry_rejects_platform() {
        let registry = PublisherRegistry::new();
        let err = registry
            .publish(&PublishRequest::from_task(&task(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::UnsupportedPlatform(p) if p == "instagram"));
    }
}
