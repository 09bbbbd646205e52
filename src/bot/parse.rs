//! Pure inspection of received messages: which ones to act on, what to feed
//! the target on stdin, and which command lines to run.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use super::executor::ExecutionResult;
use crate::discord::types::{Attachment, Message, MESSAGE_KIND_DEFAULT, MESSAGE_KIND_REPLY};

fn inline_mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<@!?\d+>").expect("mention regex"))
}

fn code_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("(?ms)```(?:.*?\n)?(.*?)```").expect("code block regex"))
}

/// True for messages the bot never reacts to: anything that is not a plain
/// message or a reply, and anything authored by a bot.
pub fn should_ignore(message: &Message) -> bool {
    match message.kind {
        MESSAGE_KIND_DEFAULT | MESSAGE_KIND_REPLY => {
            message.author.as_ref().map_or(true, |a| a.bot)
        }
        _ => true,
    }
}

/// Extract one command line per mention of the bot.
///
/// Each mention contributes the remainder of its line, cut short at a fenced
/// code block opener, with any further inline mentions stripped out.
pub fn command_lines(content: &str, bot_id: u64) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    // Compiled per call: the pattern embeds the bot's user id.
    let mention_line =
        Regex::new(&format!("(?ms)<@!?{bot_id}>(.*?)(?:```|$)")).expect("mention line regex");
    mention_line
        .captures_iter(content)
        .map(|caps| inline_mention_re().replace_all(&caps[1], "").into_owned())
        .collect()
}

/// First occurrence of each distinct command line, order preserved.
pub fn dedupe(cmds: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    cmds.into_iter().filter(|cmd| seen.insert(cmd.clone())).collect()
}

/// The body of the first fenced code block, with an optional leading
/// language tag line consumed.
pub fn code_block(content: &str) -> Option<String> {
    code_block_re()
        .captures(content)
        .map(|caps| caps[1].to_string())
}

/// First attachment whose filename carries `extension`. An empty extension
/// disables attachment input.
pub fn attachment_with_extension<'a>(
    attachments: &'a [Attachment],
    extension: &str,
) -> Option<&'a Attachment> {
    if extension.is_empty() {
        return None;
    }
    attachments.iter().find(|a| a.filename.ends_with(extension))
}

/// Usage text shown when the bot is addressed with nothing to do.
pub fn help_result(username: &str) -> ExecutionResult {
    const FENCE: &str = "```";
    // Zero-width spaces let a fence render inside a code block.
    const INNER_FENCE: &str = "`\u{200b}`\u{200b}`";
    ExecutionResult {
        content: format!(
            "{FENCE}\nUsage:\n@{username}\n{INNER_FENCE}\n[contents for standard input]\n{INNER_FENCE}\n{FENCE}"
        ),
        files: Vec::new(),
    }
}
