use crate::model::{Message, Poll};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod matrix;

pub use matrix::MatrixAdapter;

/// Something the adapter can put in a room.
#[derive(Debug, Clone)]
pub enum Artifact {
    Text(String),
    Media {
        media: MediaRef,
        caption: String,
        filename: String,
    },
    Poll(Poll),
}

/// Server-side handle to an uploaded blob.
#[derive(Debug, Clone)]
pub struct MediaRef {
    pub uri: String,
    pub mime: String,
}

/// Outcome of a send, classified for the delivery retry policy.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Delivered,
    /// Worth retrying later (rate limit, server hiccup, network).
    Transient(String),
    /// Will never succeed as-is.
    Fatal(String),
}

/// The seam between the analysis service and a concrete chat platform.
/// History arrives in arbitrary order; the filter normalizes it.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn fetch_history(
        &self,
        room_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Message>>;

    async fn send(&self, room_id: &str, artifact: &Artifact) -> SendOutcome;

    async fn upload(&self, bytes: &[u8], mime: &str, filename: &str) -> anyhow::Result<MediaRef>;
}
