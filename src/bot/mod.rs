//! The bot: turns gateway events into target executions and keeps the
//! bot's replies in sync with the source message.
//!
//! Each source message id is coalesced through a per-id slot; a worker
//! fans the message's command lines out into child processes, queries the
//! replies it posted earlier, and reconciles the two, unless a newer event
//! for the same message supersedes it first.

pub mod coalesce;
pub mod executor;
pub mod parse;
pub mod reconcile;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

use crate::config::Options;
use crate::discord::types::{
    DeletedMessage, Message, User, CHANNEL_DM, CHANNEL_GUILD_PRIVATE_THREAD,
    CHANNEL_GUILD_PUBLIC_THREAD, CHANNEL_GUILD_TEXT, MESSAGE_KIND_DEFAULT, MESSAGE_KIND_REPLY,
};
use crate::discord::{GatewayEvent, Rest};
use crate::future::{self, Future};
use crate::util::truncate_with_ellipsis;
use coalesce::{Coalescer, EventProcessor};
use executor::{execute_target, ExecutionResult, CONTENT_MAX_CHARS};
use reconcile::{reconcile, ReplyTarget};

/// A create/update/delete notification for one source message.
#[derive(Debug)]
pub enum InboundEvent {
    Create(Message),
    Update(Message),
    Delete(DeletedMessage),
}

impl InboundEvent {
    fn message_id(&self) -> u64 {
        match self {
            Self::Create(m) | Self::Update(m) => m.id,
            Self::Delete(d) => d.id,
        }
    }
}

fn log_prepare_failure(cancel: &CancellationToken, err: &anyhow::Error) {
    if cancel.is_cancelled() {
        tracing::debug!("event superseded while preparing: {err:#}");
    } else {
        tracing::error!("failed to execute commands: {err:#}");
    }
}

/// Everything a committed event applies to the remote side.
pub struct PreparedReplies {
    target: ReplyTarget,
    results: Vec<Option<ExecutionResult>>,
    keep: Vec<Message>,
    delete: Vec<Message>,
}

pub struct Bot {
    options: Arc<Options>,
    rest: Rest,
    user: OnceLock<User>,
    coalescer: Arc<Coalescer<InboundEvent>>,
}

impl Bot {
    pub fn new(options: Arc<Options>, rest: Rest, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            options,
            rest,
            user: OnceLock::new(),
            coalescer: Arc::new(Coalescer::new(shutdown)),
        })
    }

    /// Feed one gateway event into the pipeline.
    pub fn handle(self: &Arc<Self>, event: GatewayEvent) {
        match event {
            GatewayEvent::Ready(ready) => {
                tracing::info!("ready as {} ({})", ready.user.username, ready.user.id);
                let _ = self.user.set(ready.user);
            }
            GatewayEvent::MessageCreate(message) => {
                if !parse::should_ignore(&message) {
                    self.publish(InboundEvent::Create(message));
                }
            }
            GatewayEvent::MessageUpdate(message) => {
                if !parse::should_ignore(&message) {
                    self.publish(InboundEvent::Update(message));
                }
            }
            GatewayEvent::MessageDelete(deleted) => {
                self.publish(InboundEvent::Delete(deleted));
            }
        }
    }

    fn publish(self: &Arc<Self>, event: InboundEvent) {
        self.coalescer.publish(event.message_id(), event, self);
    }

    /// True once no source message is mid-pipeline.
    pub fn is_idle(&self) -> bool {
        self.coalescer.is_idle()
    }

    /// Fan the message's command lines out into execution futures.
    ///
    /// Fails on REST errors (channel lookup, attachment fetch); individual
    /// command failures are carried inside their future instead.
    async fn execute_cmds(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<Vec<Future<ExecutionResult>>> {
        if parse::should_ignore(message) {
            return Ok(Vec::new());
        }
        let bot_user = self.user.get().context("gateway not ready")?;

        let channel = self.rest.get_channel(cancel, message.channel_id).await?;
        let mut default_cmds: Vec<String> = Vec::new();
        match channel.kind {
            CHANNEL_GUILD_TEXT | CHANNEL_GUILD_PUBLIC_THREAD | CHANNEL_GUILD_PRIVATE_THREAD => {
                if !message.mentions_user(bot_user.id) {
                    return Ok(Vec::new());
                }
            }
            // A DM is an implicit address; run the target even without a
            // command line.
            CHANNEL_DM => default_cmds.push(String::new()),
            _ => return Ok(Vec::new()),
        }

        let input = match parse::attachment_with_extension(
            &message.attachments,
            &self.options.attachment_extension_to_treat_as_input,
        ) {
            Some(attachment) => Some(
                self.rest
                    .download(cancel, &attachment.url)
                    .await
                    .with_context(|| {
                        format!("failed to fetch attachment {}", attachment.filename)
                    })?,
            ),
            None => parse::code_block(&message.content).map(String::into_bytes),
        };

        let mut cmds = parse::command_lines(&message.content, bot_user.id);
        if cmds.is_empty() {
            cmds = default_cmds;
        }
        // With several commands in one message, each reply echoes its own
        // invocation so they can be told apart.
        let echo_commandline = cmds.len() > 1;
        if !cmds.is_empty() {
            let _ = self.rest.trigger_typing(cancel, message.channel_id).await;
        }

        let input = input.map(Arc::new);
        let futures = parse::dedupe(cmds)
            .into_iter()
            .map(|cmd| {
                if input.is_none() && cmd.trim().is_empty() {
                    let username = bot_user.username.clone();
                    return Future::deferred(async move { Ok(parse::help_result(&username)) });
                }
                let options = Arc::clone(&self.options);
                let cancel = cancel.clone();
                let input = input.clone();
                Future::eager(async move {
                    execute_target(
                        &cancel,
                        &options,
                        &cmd,
                        input.as_deref().map(Vec::as_slice),
                        echo_commandline,
                    )
                    .await
                })
            })
            .collect();
        Ok(futures)
    }

    /// Replies the bot previously posted to `source_id` in `channel_id`,
    /// ascending by id.
    fn replies_to(
        &self,
        channel_id: u64,
        source_id: u64,
        cancel: &CancellationToken,
    ) -> Future<Vec<Message>> {
        let bot_id = self.user.get().map_or(0, |u| u.id);
        let rest = self.rest.clone();
        let cancel = cancel.clone();
        Future::deferred(async move {
            let mut replies: Vec<Message> = rest
                .messages_after(&cancel, channel_id, source_id)
                .await
                .context("failed to get replies")?
                .into_iter()
                .filter(|m| {
                    m.author.as_ref().is_some_and(|a| a.id == bot_id)
                        && m.kind == MESSAGE_KIND_REPLY
                        && m.message_reference
                            .as_ref()
                            .and_then(|r| r.message_id)
                            .is_some_and(|id| id == source_id)
                })
                .collect();
            replies.sort_by_key(|m| m.id);
            Ok(replies)
        })
    }

    /// The bot's own messages inside the thread hanging off `source_id`,
    /// ascending by id.
    fn replies_in_thread(&self, source_id: u64, cancel: &CancellationToken) -> Future<Vec<Message>> {
        let bot_id = self.user.get().map_or(0, |u| u.id);
        let rest = self.rest.clone();
        let cancel = cancel.clone();
        Future::deferred(async move {
            let mut replies: Vec<Message> = rest
                .messages_after(&cancel, source_id, source_id)
                .await
                .context("failed to get thread replies")?
                .into_iter()
                .filter(|m| {
                    m.author.as_ref().is_some_and(|a| a.id == bot_id)
                        && m.kind == MESSAGE_KIND_DEFAULT
                })
                .collect();
            replies.sort_by_key(|m| m.id);
            Ok(replies)
        })
    }
}

#[async_trait]
impl EventProcessor<InboundEvent> for Bot {
    type Prepared = PreparedReplies;

    async fn prepare(
        &self,
        event: InboundEvent,
        cancel: &CancellationToken,
    ) -> Option<PreparedReplies> {
        let mut exec_futures = Vec::new();
        let mut keep_future = Future::resolved(Vec::new());
        let mut delete_future = Future::resolved(Vec::new());
        let target;

        match &event {
            InboundEvent::Create(message) => {
                target = ReplyTarget::for_source(message);
                exec_futures = match self.execute_cmds(message, cancel).await {
                    Ok(futures) => futures,
                    Err(err) => {
                        log_prepare_failure(cancel, &err);
                        return None;
                    }
                };
            }
            InboundEvent::Update(message) => {
                target = ReplyTarget::for_source(message);
                exec_futures = match self.execute_cmds(message, cancel).await {
                    Ok(futures) => futures,
                    Err(err) => {
                        log_prepare_failure(cancel, &err);
                        return None;
                    }
                };
                if message.has_thread() {
                    // Replies moved into the thread; the old anchored ones
                    // are stale.
                    keep_future = self.replies_in_thread(message.id, cancel);
                    delete_future = self.replies_to(message.channel_id, message.id, cancel);
                } else {
                    keep_future = self.replies_to(message.channel_id, message.id, cancel);
                }
            }
            InboundEvent::Delete(deleted) => {
                target = ReplyTarget {
                    channel_id: deleted.channel_id,
                    reference: None,
                };
                keep_future = self.replies_to(deleted.channel_id, deleted.id, cancel);
            }
        }

        let outcomes = future::await_all(cancel, exec_futures).await;
        let results = outcomes
            .into_iter()
            .map(|outcome| match outcome {
                Ok(result) => Some(result),
                Err(err) if err.is_cancelled() => None,
                // Visible failure: the reply body becomes the error text.
                Err(err) => Some(ExecutionResult {
                    content: truncate_with_ellipsis(&err.to_string(), CONTENT_MAX_CHARS - 3),
                    files: Vec::new(),
                }),
            })
            .collect();

        let keep = match keep_future.wait(cancel).await {
            Ok(replies) => replies,
            // Superseded mid-query: the compare-and-delete below sorts it
            // out, so stay quiet.
            Err(err) if err.is_cancelled() || cancel.is_cancelled() => Vec::new(),
            Err(err) => {
                tracing::error!("failed to get replies: {err}");
                return None;
            }
        };
        let delete = match delete_future.wait(cancel).await {
            Ok(replies) => replies,
            Err(err) if err.is_cancelled() || cancel.is_cancelled() => Vec::new(),
            Err(err) => {
                tracing::error!("failed to get replies to be deleted: {err}");
                return None;
            }
        };

        Some(PreparedReplies {
            target,
            results,
            keep,
            delete,
        })
    }

    async fn commit(&self, prepared: PreparedReplies, cancel: &CancellationToken) {
        if let Err(err) = reconcile(
            cancel,
            &self.rest,
            prepared.target,
            &prepared.results,
            &prepared.keep,
            &prepared.delete,
        )
        .await
        {
            tracing::error!("failed to reconcile replies: {err:#}");
        }
    }
}
