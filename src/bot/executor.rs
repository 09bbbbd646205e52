//! Child-process execution for one command line.
//!
//! The child runs in a fresh private working directory and its own process
//! group, with stdin wired to the message payload and a hard deadline.
//! Captured output is rendered into a size-bounded chat body; overflow and
//! any files the child leaves behind become attachments.

use anyhow::{Context, Result};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::Options;
use crate::discord::types::FileUpload;
use crate::shellwords;

/// Hard ceiling on reply content, in Unicode scalar values.
pub const CONTENT_MAX_CHARS: usize = 2000;

/// Outcome of one target run: the chat body plus files to attach.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub content: String,
    pub files: Vec<FileUpload>,
}

/// Run the target once for `commandline`.
///
/// `input`, when present, becomes the child's stdin and appends the
/// configured stdin args. `echo_commandline` prefixes the reply with the
/// backtick-wrapped target invocation (used when one message fans out into
/// several commands). Parse failures on `commandline` are errors; a child
/// that fails or times out still produces a normal result with a diagnostic
/// prefix.
pub async fn execute_target(
    cancel: &CancellationToken,
    options: &Options,
    commandline: &str,
    input: Option<&[u8]>,
    echo_commandline: bool,
) -> Result<ExecutionResult> {
    // Removed on drop, on every exit path.
    let workdir = tempfile::Builder::new()
        .prefix("execbot")
        .tempdir()
        .context("failed to create working directory")?;

    let mut content = String::new();

    let mut args = shellwords::split(commandline)
        .with_context(|| format!("failed to parse commandline \"{commandline}\""))?;
    if args.is_empty() {
        args = options.target_default_args.clone();
    }
    let mut cli = Vec::with_capacity(1 + args.len());
    cli.push(options.target_cli.clone());
    cli.extend(args);
    if input.is_some() {
        cli.extend(options.target_args_to_use_stdin.iter().cloned());
    }
    let full: Vec<String> = options
        .env_command
        .iter()
        .cloned()
        .chain(cli.iter().cloned())
        .collect();

    if echo_commandline {
        content.push_str(&format!("`{}`\n", shellwords::join(&cli)));
    }

    let (program, program_args) = full
        .split_first()
        .context("empty command after env prefix")?;
    let mut command = tokio::process::Command::new(program);
    command
        .args(program_args)
        .current_dir(workdir.path())
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::error!("failed to spawn {}: {err}", shellwords::join(&full));
            content.push_str(&format!("{err} with no output"));
            return Ok(ExecutionResult {
                content,
                files: Vec::new(),
            });
        }
    };

    if let Some(bytes) = input {
        let mut stdin = child.stdin.take().context("child stdin not piped")?;
        let bytes = bytes.to_vec();
        tokio::spawn(async move {
            // Dropping the handle closes the pipe; a child that stops
            // reading early is not an error.
            let _ = stdin.write_all(&bytes).await;
        });
    }

    let mut stdout_pipe = child.stdout.take().context("child stdout not piped")?;
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let mut stderr_pipe = child.stderr.take().context("child stderr not piped")?;
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let pid = child.id();
    let deadline = tokio::time::sleep(options.command_timeout());
    tokio::pin!(deadline);
    let mut timed_out = false;
    let mut interrupted = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status.context("failed to wait for child")?,
            () = &mut deadline, if !timed_out && !interrupted => {
                timed_out = true;
                interrupt_group(pid);
            }
            () = cancel.cancelled(), if !timed_out && !interrupted => {
                interrupted = true;
                interrupt_group(pid);
            }
        }
    };

    if status.success() {
        tracing::info!("executed: {}", shellwords::join(&full));
    } else {
        let cause = if timed_out {
            options.timeout_cause()
        } else if let Some(code) = status.code() {
            format!("exit status {code}")
        } else if let Some(signal) = status.signal() {
            format!("signal: {}", signal_name(signal))
        } else {
            "terminated abnormally".to_string()
        };
        tracing::error!("execute failed ({cause}): {}", shellwords::join(&full));
        content.push_str(&format!("{cause} with "));
    }

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let mut files = Vec::new();
    let mut outputs: Vec<(&str, &[u8])> = Vec::new();
    if !stdout.is_empty() {
        outputs.push(("stdout", &stdout));
    }
    if !stderr.is_empty() {
        outputs.push(("stderr", &stderr));
    }

    if outputs.is_empty() {
        content.push_str("no output");
    } else {
        for (i, (name, bytes)) in outputs.into_iter().enumerate() {
            let header = if i == 0 && !status.success() {
                format!("{name}:```\n")
            } else {
                "```\n".to_string()
            };
            let footer = "```";
            let budget = CONTENT_MAX_CHARS
                .saturating_sub(content.chars().count())
                .saturating_sub(header.chars().count())
                .saturating_sub(footer.chars().count());
            let (embed, overflow) = embed_and_overflow(
                bytes,
                options.number_of_lines_to_embed_output,
                budget,
                options.number_of_lines_to_embed_uploaded_output,
            );
            content.push_str(&header);
            content.push_str(&embed);
            content.push_str(footer);
            if let Some(bytes) = overflow {
                files.push(FileUpload {
                    name: format!("{name}.log"),
                    bytes,
                });
            }
        }
    }

    files.extend(sweep_workdir(workdir.path()).await?);

    Ok(ExecutionResult { content, files })
}

/// Signal the child's whole process group; the child leads its own group.
fn interrupt_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as i32, libc::SIGINT);
        }
    }
}

fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGINT => "interrupt".to_string(),
        libc::SIGTERM => "terminated".to_string(),
        libc::SIGKILL => "killed".to_string(),
        other => other.to_string(),
    }
}

/// Split `bytes` into an embeddable excerpt and, when the line or character
/// budget overflows, the full payload for upload.
///
/// Lines are LF bytes and the cut lands just after the Nth LF; characters
/// are Unicode scalar values and the cut lands just after the scalar that
/// consumed the last unit.
fn embed_and_overflow(
    bytes: &[u8],
    max_lines: usize,
    max_chars: usize,
    preview_lines: usize,
) -> (String, Option<Vec<u8>>) {
    if max_chars == 0 {
        return (String::new(), Some(bytes.to_vec()));
    }

    let mut pos = 0;
    let mut lines = 0;
    let mut chars = 0;
    let mut preview_end = 0;

    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            pos += c.len_utf8();
            if c == '\n' {
                lines += 1;
                if lines == preview_lines {
                    preview_end = pos;
                }
                if lines > max_lines {
                    return (lossy(&bytes[..preview_end]), Some(bytes.to_vec()));
                }
            }
            chars += 1;
            if chars == max_chars {
                return (lossy(&bytes[..pos]), Some(bytes.to_vec()));
            }
        }
        // Invalid sequences count one character per byte.
        for _ in chunk.invalid() {
            pos += 1;
            chars += 1;
            if chars == max_chars {
                return (lossy(&bytes[..pos]), Some(bytes.to_vec()));
            }
        }
    }

    (lossy(bytes), None)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Collect regular files the child left in its working directory, sorted by
/// name for deterministic attachment order.
async fn sweep_workdir(dir: &std::path::Path) -> Result<Vec<FileUpload>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .context("failed to read working directory")?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();

    let mut files = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(&name);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read file {}", path.display()))?;
        files.push(FileUpload { name, bytes });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_options(target: &str) -> Options {
        let mut options = Options::default();
        options.target_cli = target.to_string();
        // Tests run with a cleared environment just like production, so the
        // child needs an explicit PATH to resolve the target.
        options.env_command = vec![
            "/usr/bin/env".to_string(),
            "-i".to_string(),
            format!(
                "PATH={}",
                std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string())
            ),
        ];
        options
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn cat_passes_stdin_through() {
        let options = test_options("cat");
        let result = execute_target(&token(), &options, "", Some(b"hello\nworld\n"), false)
            .await
            .expect("execution should succeed");
        assert_eq!(result.content, "```\nhello\nworld\n```");
        assert!(result.files.is_empty());
    }

    #[tokio::test]
    async fn cat_numbers_lines() {
        let options = test_options("cat");
        let result = execute_target(&token(), &options, "-n", Some(b"hello\nworld\n"), false)
            .await
            .expect("execution should succeed");
        assert_eq!(result.content, "```\n     1\thello\n     2\tworld\n```");
    }

    #[tokio::test]
    async fn echoed_commandline_prefixes_content() {
        let options = test_options("echo");
        let result = execute_target(&token(), &options, "-n hi", None, true)
            .await
            .expect("execution should succeed");
        assert!(
            result.content.starts_with("`echo -n hi`\n"),
            "{}",
            result.content
        );
        assert!(result.content.contains("hi"));
    }

    #[tokio::test]
    async fn empty_commandline_uses_default_args() {
        let mut options = test_options("echo");
        options.target_default_args = vec!["defaulted".to_string()];
        let result = execute_target(&token(), &options, "", None, false)
            .await
            .expect("execution should succeed");
        assert_eq!(result.content, "```\ndefaulted\n```");
    }

    #[tokio::test]
    async fn stdin_args_appended_only_with_input() {
        let mut options = test_options("echo");
        options.target_args_to_use_stdin = vec!["-".to_string()];
        let with_input = execute_target(&token(), &options, "a", Some(b"x"), true)
            .await
            .expect("execution should succeed");
        assert!(with_input.content.starts_with("`echo a -`\n"));
        let without_input = execute_target(&token(), &options, "a", None, true)
            .await
            .expect("execution should succeed");
        assert!(without_input.content.starts_with("`echo a`\n"));
    }

    #[tokio::test]
    async fn unparsable_commandline_is_an_error() {
        let options = test_options("cat");
        let err = execute_target(&token(), &options, "\"unterminated", None, false)
            .await
            .expect_err("parse failure should be an error");
        assert!(err.to_string().contains("unmatched quote"), "{err:#}");
    }

    #[tokio::test]
    async fn nonzero_exit_prefixes_diagnostic() {
        let options = test_options("sh");
        let result = execute_target(&token(), &options, "-c 'exit 3'", None, false)
            .await
            .expect("execution should succeed");
        assert_eq!(result.content, "exit status 3 with no output");
    }

    #[tokio::test]
    async fn failed_run_labels_first_output_section() {
        let options = test_options("sh");
        let result = execute_target(&token(), &options, "-c 'echo oops >&2; exit 1'", None, false)
            .await
            .expect("execution should succeed");
        assert_eq!(result.content, "exit status 1 with stderr:```\noops\n```");
    }

    #[tokio::test]
    async fn timeout_kills_child_and_reports_cause() {
        let mut options = test_options("sleep");
        options.timeout_seconds = 1;
        let started = std::time::Instant::now();
        let result = execute_target(&token(), &options, "30", None, false)
            .await
            .expect("execution should succeed");
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "child should die at the deadline"
        );
        assert_eq!(
            result.content,
            "process killed due to timeout of 1 seconds with no output"
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_child() {
        let options = test_options("sleep");
        let cancel = token();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let result = execute_target(&cancel, &options, "30", None, false)
            .await
            .expect("execution should succeed");
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "cancellation should interrupt the child"
        );
        assert!(
            result.content.starts_with("signal: interrupt with "),
            "{}",
            result.content
        );
    }

    #[tokio::test]
    async fn long_output_spills_to_file_with_preview() {
        let options = test_options("sh");
        let script = "-c 'i=0; while [ $i -lt 100 ]; do echo line$i; i=$((i+1)); done'";
        let result = execute_target(&token(), &options, script, None, false)
            .await
            .expect("execution should succeed");
        // Three preview lines stay embedded, the full stream is attached.
        assert_eq!(result.content, "```\nline0\nline1\nline2\n```");
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].name, "stdout.log");
        let attached_lines = result.files[0].bytes.iter().filter(|&&b| b == b'\n').count();
        assert_eq!(attached_lines, 100);
    }

    #[tokio::test]
    async fn content_never_exceeds_the_ceiling() {
        let options = test_options("sh");
        // One 5000-character line: the character budget cuts the embed.
        let result = execute_target(
            &token(),
            &options,
            "-c 'printf %05000d 7'",
            None,
            false,
        )
        .await
        .expect("execution should succeed");
        assert!(result.content.chars().count() <= CONTENT_MAX_CHARS);
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].name, "stdout.log");
        assert_eq!(result.files[0].bytes.len(), 5000);
    }

    #[tokio::test]
    async fn child_written_files_are_attached() {
        let options = test_options("sh");
        let result = execute_target(
            &token(),
            &options,
            "-c 'printf hi > produced.txt; printf there > also.txt'",
            None,
            false,
        )
        .await
        .expect("execution should succeed");
        assert_eq!(result.content, "no output");
        let names: Vec<&str> = result.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["also.txt", "produced.txt"]);
        assert_eq!(result.files[1].bytes, b"hi");
    }

    #[test]
    fn embed_cut_lands_on_line_boundary() {
        let bytes = b"a\nb\nc\nd\ne\n";
        let (embed, overflow) = embed_and_overflow(bytes, 3, 1000, 2);
        assert_eq!(embed, "a\nb\n");
        assert_eq!(overflow.as_deref(), Some(bytes.as_slice()));
    }

    #[test]
    fn embed_within_budget_keeps_everything() {
        let bytes = b"a\nb\n";
        let (embed, overflow) = embed_and_overflow(bytes, 20, 1000, 3);
        assert_eq!(embed, "a\nb\n");
        assert!(overflow.is_none());
    }

    #[test]
    fn embed_char_budget_cuts_after_last_scalar() {
        // Multi-byte scalars: budget counts characters, not bytes.
        let bytes = "ありがとう".as_bytes();
        let (embed, overflow) = embed_and_overflow(bytes, 20, 3, 3);
        assert_eq!(embed, "ありが");
        assert_eq!(overflow.as_deref(), Some(bytes));
    }

    #[test]
    fn embed_zero_budget_spills_everything() {
        let bytes = b"abc";
        let (embed, overflow) = embed_and_overflow(bytes, 20, 0, 3);
        assert_eq!(embed, "");
        assert_eq!(overflow.as_deref(), Some(bytes.as_slice()));
    }
}
