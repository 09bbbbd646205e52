//! Reply reconciliation.
//!
//! Pairs a fresh, ordered batch of execution results against the ordered
//! list of replies the bot already posted: position k is edited in place,
//! surplus results become new replies, surplus replies are deleted. A second
//! list of stale replies (e.g. out-of-thread replies after the source gained
//! a thread) is deleted unconditionally.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::executor::ExecutionResult;
use crate::discord::types::Message;
use crate::discord::Rest;

/// Where newly created replies go.
#[derive(Debug, Clone, Copy)]
pub struct ReplyTarget {
    pub channel_id: u64,
    /// Message id to anchor the reply to; `None` inside a thread, where the
    /// thread itself is the anchor.
    pub reference: Option<u64>,
}

impl ReplyTarget {
    /// Replies to a threaded message go into its thread (whose channel id is
    /// the message id) without a reference; otherwise they anchor to the
    /// message in its own channel.
    pub fn for_source(message: &Message) -> Self {
        if message.has_thread() {
            Self {
                channel_id: message.id,
                reference: None,
            }
        } else {
            Self {
                channel_id: message.channel_id,
                reference: Some(message.id),
            }
        }
    }
}

/// The three reply operations the reconciler performs. Implemented by the
/// REST client and by an in-memory double in tests.
#[async_trait]
pub trait ReplyApi: Send + Sync {
    async fn create_reply(
        &self,
        cancel: &CancellationToken,
        target: ReplyTarget,
        result: &ExecutionResult,
    ) -> Result<()>;

    async fn edit_reply(
        &self,
        cancel: &CancellationToken,
        channel_id: u64,
        message_id: u64,
        result: &ExecutionResult,
    ) -> Result<()>;

    async fn delete_reply(
        &self,
        cancel: &CancellationToken,
        channel_id: u64,
        message_id: u64,
    ) -> Result<()>;
}

#[async_trait]
impl ReplyApi for Rest {
    async fn create_reply(
        &self,
        cancel: &CancellationToken,
        target: ReplyTarget,
        result: &ExecutionResult,
    ) -> Result<()> {
        self.create_message(
            cancel,
            target.channel_id,
            &result.content,
            target.reference,
            &result.files,
        )
        .await
        .map(|_| ())
    }

    async fn edit_reply(
        &self,
        cancel: &CancellationToken,
        channel_id: u64,
        message_id: u64,
        result: &ExecutionResult,
    ) -> Result<()> {
        self.edit_message(cancel, channel_id, message_id, &result.content, &result.files)
            .await
            .map(|_| ())
    }

    async fn delete_reply(
        &self,
        cancel: &CancellationToken,
        channel_id: u64,
        message_id: u64,
    ) -> Result<()> {
        self.delete_message(cancel, channel_id, message_id).await
    }
}

/// Reconcile `results` against `keep`, then delete everything in `delete`.
///
/// A `None` result marks an execution whose outcome never materialized
/// (cancelled mid-flight); its slot is left untouched so the pairing indices
/// of later results stay stable.
pub async fn reconcile(
    cancel: &CancellationToken,
    api: &dyn ReplyApi,
    target: ReplyTarget,
    results: &[Option<ExecutionResult>],
    keep: &[Message],
    delete: &[Message],
) -> Result<()> {
    for k in 0..results.len().max(keep.len()) {
        match (results.get(k), keep.get(k)) {
            (Some(Some(result)), Some(reply)) => {
                api.edit_reply(cancel, reply.channel_id, reply.id, result).await?;
            }
            (Some(Some(result)), None) => {
                api.create_reply(cancel, target, result).await?;
            }
            (Some(None), _) => {}
            (None, Some(reply)) => {
                api.delete_reply(cancel, reply.channel_id, reply.id).await?;
            }
            (None, None) => unreachable!("k is bounded by the longer list"),
        }
    }
    for reply in delete {
        api.delete_reply(cancel, reply.channel_id, reply.id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Create(String),
        Edit(u64, String),
        Delete(u64),
    }

    #[derive(Default)]
    struct RecordingApi {
        ops: Mutex<Vec<Op>>,
    }

    #[async_trait]
    impl ReplyApi for RecordingApi {
        async fn create_reply(
            &self,
            _cancel: &CancellationToken,
            _target: ReplyTarget,
            result: &ExecutionResult,
        ) -> Result<()> {
            self.ops.lock().push(Op::Create(result.content.clone()));
            Ok(())
        }

        async fn edit_reply(
            &self,
            _cancel: &CancellationToken,
            _channel_id: u64,
            message_id: u64,
            result: &ExecutionResult,
        ) -> Result<()> {
            self.ops
                .lock()
                .push(Op::Edit(message_id, result.content.clone()));
            Ok(())
        }

        async fn delete_reply(
            &self,
            _cancel: &CancellationToken,
            _channel_id: u64,
            message_id: u64,
        ) -> Result<()> {
            self.ops.lock().push(Op::Delete(message_id));
            Ok(())
        }
    }

    fn result(content: &str) -> Option<ExecutionResult> {
        Some(ExecutionResult {
            content: content.to_string(),
            files: Vec::new(),
        })
    }

    fn reply(id: u64) -> Message {
        Message {
            id,
            channel_id: 10,
            guild_id: None,
            author: None,
            content: String::new(),
            mentions: Vec::new(),
            attachments: Vec::new(),
            kind: 0,
            flags: 0,
            message_reference: None,
        }
    }

    fn target() -> ReplyTarget {
        ReplyTarget {
            channel_id: 10,
            reference: Some(1),
        }
    }

    async fn run(
        results: &[Option<ExecutionResult>],
        keep: &[Message],
        delete: &[Message],
    ) -> Vec<Op> {
        let api = RecordingApi::default();
        let cancel = CancellationToken::new();
        reconcile(&cancel, &api, target(), results, keep, delete)
            .await
            .expect("reconcile should succeed");
        let ops = api.ops.lock().clone();
        ops
    }

    #[tokio::test]
    async fn equal_lengths_edit_in_order() {
        let ops = run(&[result("a"), result("b")], &[reply(101), reply(102)], &[]).await;
        assert_eq!(
            ops,
            vec![
                Op::Edit(101, "a".to_string()),
                Op::Edit(102, "b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn surplus_results_create_new_replies() {
        let ops = run(&[result("a"), result("b"), result("c")], &[reply(101)], &[]).await;
        assert_eq!(
            ops,
            vec![
                Op::Edit(101, "a".to_string()),
                Op::Create("b".to_string()),
                Op::Create("c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn surplus_replies_are_deleted() {
        let ops = run(&[result("a")], &[reply(101), reply(102), reply(103)], &[]).await;
        assert_eq!(
            ops,
            vec![
                Op::Edit(101, "a".to_string()),
                Op::Delete(102),
                Op::Delete(103),
            ]
        );
    }

    #[tokio::test]
    async fn no_results_deletes_everything() {
        let ops = run(&[], &[reply(101), reply(102)], &[]).await;
        assert_eq!(ops, vec![Op::Delete(101), Op::Delete(102)]);
    }

    #[tokio::test]
    async fn delete_set_is_removed_after_pairing() {
        let ops = run(&[result("a")], &[], &[reply(201), reply(202)]).await;
        assert_eq!(
            ops,
            vec![
                Op::Create("a".to_string()),
                Op::Delete(201),
                Op::Delete(202),
            ]
        );
    }

    #[tokio::test]
    async fn missing_result_leaves_paired_reply_alone() {
        let ops = run(&[None, result("b")], &[reply(101), reply(102)], &[]).await;
        assert_eq!(ops, vec![Op::Edit(102, "b".to_string())]);
    }

    #[tokio::test]
    async fn pairing_counts_match_lengths() {
        // m results against n replies: min(m,n) edits, m-n creates, n-m
        // deletes.
        for (m, n) in [(0usize, 0usize), (3, 1), (1, 3), (4, 4)] {
            let results: Vec<Option<ExecutionResult>> =
                (0..m).map(|i| result(&format!("r{i}"))).collect();
            let keep: Vec<Message> = (0..n).map(|i| reply(100 + i as u64)).collect();
            let ops = run(&results, &keep, &[]).await;
            let edits = ops.iter().filter(|op| matches!(op, Op::Edit(..))).count();
            let creates = ops.iter().filter(|op| matches!(op, Op::Create(..))).count();
            let deletes = ops.iter().filter(|op| matches!(op, Op::Delete(..))).count();
            assert_eq!(edits, m.min(n));
            assert_eq!(creates, m.saturating_sub(n));
            assert_eq!(deletes, n.saturating_sub(m));
        }
    }

    #[test]
    fn thread_target_drops_the_reference() {
        let mut source = reply(55);
        source.flags = crate::discord::types::MESSAGE_FLAG_HAS_THREAD;
        let target = ReplyTarget::for_source(&source);
        assert_eq!(target.channel_id, 55);
        assert_eq!(target.reference, None);

        let plain = reply(56);
        let target = ReplyTarget::for_source(&plain);
        assert_eq!(target.channel_id, 10);
        assert_eq!(target.reference, Some(56));
    }
}
