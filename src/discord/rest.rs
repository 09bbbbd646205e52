//! Discord REST client.
//!
//! Thin wrapper over `reqwest` covering the handful of endpoints the bot
//! uses. Every call carries the configured REST timeout and races the
//! caller's cancel token, so superseded pipeline work cannot land late side
//! effects.

use anyhow::{bail, Context, Result};
use reqwest::multipart::{Form, Part};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::types::{Channel, FileUpload, Message};

const API_BASE: &str = "https://discord.com/api/v10";

/// Upper bound Discord accepts for a single message-list page.
const MESSAGES_PAGE_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct Rest {
    http: reqwest::Client,
    token: String,
}

/// Run `request` to completion unless `cancel` fires first.
async fn race<T>(
    cancel: &CancellationToken,
    request: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        result = request => result,
        () = cancel.cancelled() => bail!("rest call cancelled"),
    }
}

impl Rest {
    pub fn new(token: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{API_BASE}{path}")
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
        bail!("{what} failed ({status}): {body}")
    }

    /// Resolve the gateway WebSocket URL for this bot.
    pub async fn gateway_url(&self) -> Result<String> {
        let resp = self
            .http
            .get(self.url("/gateway/bot"))
            .header("Authorization", self.auth())
            .send()
            .await
            .context("gateway url request failed")?;
        let body: serde_json::Value = Self::check(resp, "get gateway url").await?.json().await?;
        Ok(body
            .get("url")
            .and_then(|u| u.as_str())
            .unwrap_or("wss://gateway.discord.gg")
            .to_string())
    }

    pub async fn get_channel(&self, cancel: &CancellationToken, channel_id: u64) -> Result<Channel> {
        race(cancel, async {
            let resp = self
                .http
                .get(self.url(&format!("/channels/{channel_id}")))
                .header("Authorization", self.auth())
                .send()
                .await
                .context("get channel request failed")?;
            Ok(Self::check(resp, "get channel").await?.json().await?)
        })
        .await
    }

    /// Fetch up to one page of messages in `channel_id` newer than `after`.
    pub async fn messages_after(
        &self,
        cancel: &CancellationToken,
        channel_id: u64,
        after: u64,
    ) -> Result<Vec<Message>> {
        race(cancel, async {
            let resp = self
                .http
                .get(self.url(&format!("/channels/{channel_id}/messages")))
                .query(&[("after", after.to_string()), ("limit", MESSAGES_PAGE_LIMIT.to_string())])
                .header("Authorization", self.auth())
                .send()
                .await
                .context("get messages request failed")?;
            Ok(Self::check(resp, "get messages").await?.json().await?)
        })
        .await
    }

    /// Post a message, optionally replying to `reference` and attaching
    /// `files` (multipart upload when present).
    pub async fn create_message(
        &self,
        cancel: &CancellationToken,
        channel_id: u64,
        content: &str,
        reference: Option<u64>,
        files: &[FileUpload],
    ) -> Result<Message> {
        let mut payload = json!({ "content": content });
        if let Some(message_id) = reference {
            payload["message_reference"] = json!({ "message_id": message_id.to_string() });
        }
        race(cancel, async {
            let req = self
                .http
                .post(self.url(&format!("/channels/{channel_id}/messages")))
                .header("Authorization", self.auth());
            let req = if files.is_empty() {
                req.json(&payload)
            } else {
                req.multipart(multipart_form(&payload, files))
            };
            let resp = req.send().await.context("create message request failed")?;
            Ok(Self::check(resp, "create message").await?.json().await?)
        })
        .await
    }

    /// Edit a message in place. Existing attachments are retained; new
    /// `files` are added to them.
    pub async fn edit_message(
        &self,
        cancel: &CancellationToken,
        channel_id: u64,
        message_id: u64,
        content: &str,
        files: &[FileUpload],
    ) -> Result<Message> {
        let payload = json!({ "content": content });
        race(cancel, async {
            let req = self
                .http
                .patch(self.url(&format!("/channels/{channel_id}/messages/{message_id}")))
                .header("Authorization", self.auth());
            let req = if files.is_empty() {
                req.json(&payload)
            } else {
                req.multipart(multipart_form(&payload, files))
            };
            let resp = req.send().await.context("edit message request failed")?;
            Ok(Self::check(resp, "edit message").await?.json().await?)
        })
        .await
    }

    pub async fn delete_message(
        &self,
        cancel: &CancellationToken,
        channel_id: u64,
        message_id: u64,
    ) -> Result<()> {
        race(cancel, async {
            let resp = self
                .http
                .delete(self.url(&format!("/channels/{channel_id}/messages/{message_id}")))
                .header("Authorization", self.auth())
                .send()
                .await
                .context("delete message request failed")?;
            Self::check(resp, "delete message").await?;
            Ok(())
        })
        .await
    }

    /// Fire a typing indicator in `channel_id`. Best-effort.
    pub async fn trigger_typing(&self, cancel: &CancellationToken, channel_id: u64) -> Result<()> {
        race(cancel, async {
            let resp = self
                .http
                .post(self.url(&format!("/channels/{channel_id}/typing")))
                .header("Authorization", self.auth())
                .send()
                .await
                .context("typing request failed")?;
            Self::check(resp, "trigger typing").await?;
            Ok(())
        })
        .await
    }

    /// Current nickname of `user_id` in `guild_id`, if any.
    pub async fn member_nick(
        &self,
        cancel: &CancellationToken,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<String>> {
        race(cancel, async {
            let resp = self
                .http
                .get(self.url(&format!("/guilds/{guild_id}/members/{user_id}")))
                .header("Authorization", self.auth())
                .send()
                .await
                .context("get member request failed")?;
            let body: serde_json::Value = Self::check(resp, "get member").await?.json().await?;
            Ok(body
                .get("nick")
                .and_then(|n| n.as_str())
                .map(ToString::to_string))
        })
        .await
    }

    /// Set the bot's own nickname in `guild_id`.
    pub async fn set_own_nick(
        &self,
        cancel: &CancellationToken,
        guild_id: u64,
        nick: &str,
    ) -> Result<()> {
        race(cancel, async {
            let resp = self
                .http
                .patch(self.url(&format!("/guilds/{guild_id}/members/@me")))
                .header("Authorization", self.auth())
                .json(&json!({ "nick": nick }))
                .send()
                .await
                .context("update nickname request failed")?;
            Self::check(resp, "update nickname").await?;
            Ok(())
        })
        .await
    }

    /// Download an attachment body. Attachment CDN URLs are unauthenticated.
    pub async fn download(&self, cancel: &CancellationToken, url: &str) -> Result<Vec<u8>> {
        race(cancel, async {
            let resp = self
                .http
                .get(url)
                .send()
                .await
                .with_context(|| format!("failed to download attachment {url}"))?;
            let resp = Self::check(resp, "download attachment").await?;
            Ok(resp.bytes().await?.to_vec())
        })
        .await
    }
}

fn multipart_form(payload: &serde_json::Value, files: &[FileUpload]) -> Form {
    let mut form = Form::new().text("payload_json", payload.to_string());
    for (i, file) in files.iter().enumerate() {
        form = form.part(
            format!("files[{i}]"),
            Part::bytes(file.bytes.clone()).file_name(file.name.clone()),
        );
    }
    form
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn race_yields_cancellation_error() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = race(&cancel, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        let err = result.expect_err("cancelled request should fail");
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn multipart_form_builds_with_files() {
        let files = vec![
            FileUpload {
                name: "stdout.log".to_string(),
                bytes: b"hello".to_vec(),
            },
            FileUpload {
                name: "out.txt".to_string(),
                bytes: b"world".to_vec(),
            },
        ];
        // Form construction itself must not panic and must accept multiple
        // parts; the boundary is opaque so there is nothing more to assert.
        let _ = multipart_form(&json!({"content": "x"}), &files);
    }
}
