//! Bot configuration.
//!
//! Options are loaded either from environment variables (which are consumed
//! as they are read, then the process re-executes itself with the serialized
//! options piped to its own stdin so secrets never sit in `/proc/*/environ`)
//! or from a JSON object on standard input (`--stdin`).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::os::fd::FromRawFd;
use std::os::unix::process::CommandExt;
use std::time::Duration;

use crate::shellwords;

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_REST_TIMEOUT_SECONDS: u64 = 10;

/// Runtime options. JSON field names match the environment variable spelling
/// so a config object can be piped in with `--stdin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Options {
    /// Filename suffix that marks an attachment as stdin input. Empty
    /// disables attachment input.
    pub attachment_extension_to_treat_as_input: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub discord_nickname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub discord_playing: String,
    pub discord_token: String,
    /// Argv prefix the target is launched through, e.g. `/usr/bin/env -i`.
    pub env_command: Vec<String>,
    pub number_of_lines_to_embed_output: usize,
    pub number_of_lines_to_embed_uploaded_output: usize,
    pub rest_timeout_seconds: u64,
    pub target_args_to_use_stdin: Vec<String>,
    #[serde(rename = "TargetCLI")]
    pub target_cli: String,
    pub target_default_args: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            attachment_extension_to_treat_as_input: String::new(),
            discord_nickname: String::new(),
            discord_playing: String::new(),
            discord_token: String::new(),
            env_command: vec!["/usr/bin/env".to_string(), "-i".to_string()],
            number_of_lines_to_embed_output: 20,
            number_of_lines_to_embed_uploaded_output: 3,
            rest_timeout_seconds: DEFAULT_REST_TIMEOUT_SECONDS,
            target_args_to_use_stdin: Vec::new(),
            target_cli: "cat".to_string(),
            target_default_args: Vec::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

fn take_env(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    std::env::remove_var(key);
    Some(value)
}

fn take_env_list(key: &str) -> Result<Option<Vec<String>>> {
    match take_env(key) {
        Some(value) => Ok(Some(
            shellwords::split(&value).with_context(|| format!("failed to parse {key}"))?,
        )),
        None => Ok(None),
    }
}

fn take_env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match take_env(key) {
        Some(value) => Ok(Some(
            value
                .parse()
                .with_context(|| format!("invalid value for {key}"))?,
        )),
        None => Ok(None),
    }
}

impl Options {
    /// Load options from environment variables, consuming each variable as
    /// it is read.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();

        if let Some(v) = take_env("ATTACHMENT_EXTENSION_TO_TREAT_AS_INPUT") {
            options.attachment_extension_to_treat_as_input = v;
        }
        if let Some(v) = take_env("DISCORD_NICKNAME") {
            options.discord_nickname = v;
        }
        if let Some(v) = take_env("DISCORD_PLAYING") {
            options.discord_playing = v;
        }
        if let Some(v) = take_env("DISCORD_TOKEN") {
            options.discord_token = v;
        }
        if let Some(v) = take_env_list("ENV_COMMAND")? {
            options.env_command = v;
        }
        if let Some(v) = take_env_number("NUMBER_OF_LINES_TO_EMBED_OUTPUT")? {
            options.number_of_lines_to_embed_output = v;
        }
        if let Some(v) = take_env_number("NUMBER_OF_LINES_TO_EMBED_UPLOADED_OUTPUT")? {
            options.number_of_lines_to_embed_uploaded_output = v;
        }
        if let Some(v) = take_env_number("REST_TIMEOUT_SECONDS")? {
            options.rest_timeout_seconds = v;
        }
        if let Some(v) = take_env_list("TARGET_ARGS_TO_USE_STDIN")? {
            options.target_args_to_use_stdin = v;
        }
        if let Some(v) = take_env("TARGET_CLI") {
            options.target_cli = v;
        }
        if let Some(v) = take_env_list("TARGET_DEFAULT_ARGS")? {
            options.target_default_args = v;
        }
        if let Some(v) = take_env_number("TIMEOUT_SECONDS")? {
            options.timeout_seconds = v;
        }

        if options.discord_token.is_empty() {
            bail!("`DISCORD_TOKEN` is missing in environment variables");
        }

        // The env-cleared child still needs to resolve the target binary.
        if !options.env_command.iter().any(|s| s.starts_with("PATH=")) {
            options
                .env_command
                .push(format!("PATH={}", std::env::var("PATH").unwrap_or_default()));
        }

        Ok(options)
    }

    /// Load options from a JSON object on standard input.
    pub fn from_stdin() -> Result<Self> {
        let options: Self = serde_json::from_reader(std::io::stdin().lock())
            .context("failed to decode options JSON from stdin")?;
        if options.discord_token.is_empty() {
            bail!("`DISCORD_TOKEN` is missing in JSON");
        }
        Ok(options)
    }

    /// Nickname shown in guilds; falls back to the target executable name.
    pub fn nickname(&self) -> &str {
        if self.discord_nickname.is_empty() {
            &self.target_cli
        } else {
            &self.discord_nickname
        }
    }

    /// "Playing" presence text; falls back to the target executable name.
    pub fn playing(&self) -> &str {
        if self.discord_playing.is_empty() {
            &self.target_cli
        } else {
            &self.discord_playing
        }
    }

    fn effective_timeout_seconds(&self) -> u64 {
        if self.timeout_seconds == 0 {
            DEFAULT_TIMEOUT_SECONDS
        } else {
            self.timeout_seconds
        }
    }

    /// Deadline applied to each child process.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.effective_timeout_seconds())
    }

    /// Human-readable cause attached to a child that hit its deadline.
    pub fn timeout_cause(&self) -> String {
        format!(
            "process killed due to timeout of {} seconds",
            self.effective_timeout_seconds()
        )
    }

    /// Deadline applied to each REST call.
    pub fn rest_timeout(&self) -> Duration {
        let secs = if self.rest_timeout_seconds == 0 {
            DEFAULT_REST_TIMEOUT_SECONDS
        } else {
            self.rest_timeout_seconds
        };
        Duration::from_secs(secs)
    }

    /// Re-execute the current binary with these options piped to its stdin.
    ///
    /// On success this call never returns; the returned error describes why
    /// the pipe setup or `execve` failed.
    pub fn exec_with_options_on_stdin(&self) -> anyhow::Error {
        match self.try_exec() {
            Ok(never) => match never {},
            Err(err) => err,
        }
    }

    fn try_exec(&self) -> Result<std::convert::Infallible> {
        let json = serde_json::to_vec(self).context("failed to serialize options to JSON")?;

        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error()).context("failed to create pipe");
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        if unsafe { libc::dup2(read_fd, libc::STDIN_FILENO) } < 0 {
            return Err(std::io::Error::last_os_error()).context("failed to redirect stdin");
        }
        unsafe { libc::close(read_fd) };

        // The serialized options fit well inside the pipe buffer, so this
        // write completes without a reader.
        let mut pipe = unsafe { std::fs::File::from_raw_fd(write_fd) };
        pipe.write_all(&json).context("failed to write to pipe")?;
        drop(pipe);

        let executable = std::env::current_exe().context("failed to get executable path")?;
        let args: Vec<String> = std::env::args().skip(1).collect();
        let err = std::process::Command::new(executable)
            .arg("--stdin")
            .args(args)
            .exec();
        Err(err).context("failed to exec process")
    }
}
