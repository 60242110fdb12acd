//! Scheduled post ("agendamento") domain model.
//!
//! An agendamento is created by the scheduling UI and is the system of record
//! for a post: the queue only carries a snapshot of it. This module defines the
//! record, its platform-specific payload and the status state machine that the
//! loader and the workers drive.
//!
//! # Status lifecycle
//!
//! ```text
//!  pending ──► queued ──► publishing ──► published
//!                ▲            │
//!                │            ▼
//!                └──────── failed (terminal once retries are exhausted)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Status of a scheduled post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgendamentoStatus {
    /// Waiting for its due time to arrive.
    Pending,
    /// Claimed by a sweep and handed to the job queue.
    Queued,
    /// A worker is calling the platform API.
    Publishing,
    /// The post is live on the platform.
    Published,
    /// The last attempt failed. Terminal once the job is dead-lettered.
    Failed,
}

impl AgendamentoStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [AgendamentoStatus; 5] = [
        AgendamentoStatus::Pending,
        AgendamentoStatus::Queued,
        AgendamentoStatus::Publishing,
        AgendamentoStatus::Published,
        AgendamentoStatus::Failed,
    ];

    /// Returns the storage representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgendamentoStatus::Pending => "pending",
            AgendamentoStatus::Queued => "queued",
            AgendamentoStatus::Publishing => "publishing",
            AgendamentoStatus::Published => "published",
            AgendamentoStatus::Failed => "failed",
        }
    }

    /// Returns whether moving from `self` to `next` is a legal transition.
    ///
    /// Besides the forward edges, three edges exist:
    /// - `failed -> queued`: a failed attempt is retried.
    /// - `publishing -> publishing`: a job recovered from a crashed worker
    ///   starts a new attempt.
    /// - `queued -> pending`: the loader releases a claim whose enqueue failed.
    pub fn can_transition_to(&self, next: AgendamentoStatus) -> bool {
        use AgendamentoStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Pending)
                | (Queued, Publishing)
                | (Failed, Publishing)
                | (Publishing, Publishing)
                | (Publishing, Published)
                | (Publishing, Failed)
                | (Failed, Queued)
        )
    }

    /// Returns whether no further transition can leave this status.
    ///
    /// `failed` is only terminal once the job has been dead-lettered, which is
    /// tracked by the queue, so it is not reported here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgendamentoStatus::Published)
    }
}

impl fmt::Display for AgendamentoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgendamentoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AgendamentoStatus::Pending),
            "queued" => Ok(AgendamentoStatus::Queued),
            "publishing" => Ok(AgendamentoStatus::Publishing),
            "published" => Ok(AgendamentoStatus::Published),
            "failed" => Ok(AgendamentoStatus::Failed),
            other => Err(format!("unknown agendamento status '{}'", other)),
        }
    }
}

/// External platform a post is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Instagram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "instagram" => Ok(Platform::Instagram),
            other => Err(format!("unsupported platform '{}'", other)),
        }
    }
}

/// Kind of a media attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

/// Reference to a publicly reachable media file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub kind: MediaKind,
}

impl MediaRef {
    pub fn image(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: MediaKind::Image,
        }
    }

    pub fn video(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: MediaKind::Video,
        }
    }
}

/// Content of a scheduled post.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PostPayload {
    /// Caption text, hashtags included.
    #[serde(default)]
    pub caption: String,
    /// Media attachments in display order. More than one becomes a carousel.
    #[serde(default)]
    pub media: Vec<MediaRef>,
}

impl PostPayload {
    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            caption: caption.into(),
            media: Vec::new(),
        }
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media.push(media);
        self
    }
}

/// A scheduled post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agendamento {
    /// Unique identifier.
    pub id: Uuid,
    /// Time after which the post becomes eligible for publishing.
    pub due_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: AgendamentoStatus,
    /// Platform integration used to publish.
    pub target_platform: Platform,
    /// Platform-specific content.
    pub payload: PostPayload,
    /// Number of publish attempts made so far.
    pub attempt_count: u32,
    /// Most recent failure reason.
    pub last_error: Option<String>,
    /// Identifier the platform assigned to the published post.
    pub external_post_id: Option<String>,
    /// When the post went live.
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agendamento {
    /// Creates a new pending agendamento.
    pub fn new(due_at: DateTime<Utc>, target_platform: Platform, payload: PostPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            due_at,
            status: AgendamentoStatus::Pending,
            target_platform,
            payload,
            attempt_count: 0,
            last_error: None,
            external_post_id: None,
            published_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns whether the post is pending and its due time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == AgendamentoStatus::Pending && self.due_at <= now
    }
}
