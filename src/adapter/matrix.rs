//! Client-server API adapter for Matrix homeservers. History comes from the
//! paginated `/messages` endpoint, sends go through `/send` with a
//! monotonic transaction id, and polls use the MSC3381 event type.

use crate::adapter::{Artifact, ChatAdapter, MediaRef, SendOutcome};
use crate::model::{Message, MessageKind, Poll};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const PAGE_SIZE: usize = 100;

pub struct MatrixAdapter {
    http: reqwest::Client,
    homeserver: String,
    token: String,
    txn: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    chunk: Vec<RawEvent>,
    end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    event_id: String,
    sender: String,
    origin_server_ts: i64,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    content_uri: String,
}

impl MatrixAdapter {
    pub fn new(homeserver: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            homeserver: homeserver.trim_end_matches('/').to_string(),
            token: token.to_string(),
            txn: AtomicU64::new(Utc::now().timestamp_millis() as u64),
        }
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(&self.token)
    }

    fn next_txn(&self) -> u64 {
        self.txn.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_event(&self, room_id: &str, event_type: &str, content: Value) -> SendOutcome {
        let url = format!(
            "{}/_matrix/client/v3/rooms/{}/send/{}/{}",
            self.homeserver,
            room_id,
            event_type,
            self.next_txn()
        );
        let response = match self.auth(self.http.put(url)).json(&content).send().await {
            Ok(response) => response,
            Err(e) => return SendOutcome::Transient(format!("send request failed: {e}")),
        };
        classify_status(response.status())
    }
}

fn classify_status(status: reqwest::StatusCode) -> SendOutcome {
    if status.is_success() {
        SendOutcome::Delivered
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SendOutcome::Transient(format!("homeserver answered {status}"))
    } else {
        SendOutcome::Fatal(format!("homeserver answered {status}"))
    }
}

fn normalize(event: RawEvent, room_id: &str) -> Message {
    let timestamp = Utc
        .timestamp_millis_opt(event.origin_server_ts)
        .single()
        .unwrap_or_else(Utc::now);
    let body = event
        .content
        .get("body")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let kind = if event.event_type == "m.room.message" {
        match event.content.get("msgtype").and_then(Value::as_str) {
            Some("m.text") | Some("m.notice") => MessageKind::Text,
            Some("m.emote") => MessageKind::Emote,
            Some("m.image") | Some("m.file") | Some("m.video") | Some("m.audio") => {
                MessageKind::Media
            }
            _ => MessageKind::System,
        }
    } else {
        MessageKind::System
    };
    // Display name lookups cost one request per member; the localpart is
    // good enough for prompts.
    let sender_name = event
        .sender
        .trim_start_matches('@')
        .split(':')
        .next()
        .unwrap_or(&event.sender)
        .to_string();
    Message {
        id: event.event_id,
        room_id: room_id.to_string(),
        sender_id: event.sender,
        sender_name,
        timestamp,
        body,
        kind,
    }
}

fn poll_content(poll: &Poll) -> Value {
    let answers: Vec<Value> = poll
        .options
        .iter()
        .enumerate()
        .map(|(i, option)| {
            json!({
                "id": format!("option-{i}"),
                "org.matrix.msc1767.text": option,
            })
        })
        .collect();
    json!({
        "org.matrix.msc3381.poll.start": {
            "question": { "org.matrix.msc1767.text": poll.question },
            "kind": "org.matrix.msc3381.poll.disclosed",
            "max_selections": 1,
            "answers": answers,
        },
        "org.matrix.msc1767.text": poll.question,
    })
}

#[async_trait]
impl ChatAdapter for MatrixAdapter {
    async fn fetch_history(
        &self,
        room_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Message>> {
        let mut messages = Vec::new();
        let mut from: Option<String> = None;

        loop {
            let url = format!(
                "{}/_matrix/client/v3/rooms/{}/messages",
                self.homeserver, room_id
            );
            let mut request = self
                .auth(self.http.get(url))
                .query(&[("dir", "b".to_string()), ("limit", PAGE_SIZE.to_string())]);
            if let Some(token) = &from {
                request = request.query(&[("from", token.as_str())]);
            }
            let response: MessagesResponse = request
                .send()
                .await
                .context("history request failed")?
                .error_for_status()
                .context("history request rejected")?
                .json()
                .await
                .context("history response malformed")?;

            let page_len = response.chunk.len();
            let mut reached_window_edge = false;
            for event in response.chunk {
                let message = normalize(event, room_id);
                if message.timestamp < since {
                    reached_window_edge = true;
                    break;
                }
                messages.push(message);
            }

            if reached_window_edge || messages.len() >= limit || page_len == 0 {
                break;
            }
            match response.end {
                Some(token) => from = Some(token),
                None => break,
            }
        }

        debug!(room = room_id, count = messages.len(), "history fetched");
        Ok(messages)
    }

    async fn send(&self, room_id: &str, artifact: &Artifact) -> SendOutcome {
        match artifact {
            Artifact::Text(text) => {
                self.send_event(
                    room_id,
                    "m.room.message",
                    json!({ "msgtype": "m.text", "body": text }),
                )
                .await
            }
            Artifact::Media {
                media,
                caption,
                filename,
            } => {
                let msgtype = if media.mime.starts_with("image/") {
                    "m.image"
                } else {
                    "m.file"
                };
                self.send_event(
                    room_id,
                    "m.room.message",
                    json!({
                        "msgtype": msgtype,
                        "body": caption,
                        "filename": filename,
                        "url": media.uri,
                        "info": { "mimetype": media.mime },
                    }),
                )
                .await
            }
            Artifact::Poll(poll) => {
                self.send_event(room_id, "org.matrix.msc3381.poll.start", poll_content(poll))
                    .await
            }
        }
    }

    async fn upload(&self, bytes: &[u8], mime: &str, filename: &str) -> anyhow::Result<MediaRef> {
        let url = format!("{}/_matrix/media/v3/upload", self.homeserver);
        let response = self
            .auth(self.http.post(url))
            .query(&[("filename", filename)])
            .header(reqwest::header::CONTENT_TYPE, mime)
            .body(bytes.to_vec())
            .send()
            .await
            .context("upload request failed")?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "media upload rejected");
            anyhow::bail!("upload rejected with {}", response.status());
        }
        let uploaded: UploadResponse = response.json().await.context("upload response malformed")?;
        Ok(MediaRef {
            uri: uploaded.content_uri,
            mime: mime.to_string(),
        })
    }
}
