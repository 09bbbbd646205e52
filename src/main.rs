use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use execbot::bot::Bot;
use execbot::config::Options;
use execbot::discord::{gateway, Rest};

/// Run a CLI from Discord: mention the bot with arguments and a code block
/// or attachment for stdin, get the output back as replies.
#[derive(Parser, Debug)]
#[command(name = "execbot", version)]
struct Cli {
    /// Keep options in the environment instead of re-executing with them on
    /// stdin
    #[arg(long)]
    debug: bool,

    /// Read a JSON options object from standard input
    #[arg(long)]
    stdin: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let options = if cli.stdin {
        Options::from_stdin()?
    } else {
        let options = Options::from_env()?;
        if !cli.debug {
            // Hand the secrets over on stdin and replace this process; only
            // an error ever comes back.
            return Err(options.exec_with_options_on_stdin());
        }
        options
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(serve(Arc::new(options)))
}

async fn serve(options: Arc<Options>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        });
    }

    let rest = Rest::new(&options.discord_token, options.rest_timeout())?;
    let bot = Bot::new(Arc::clone(&options), rest.clone(), shutdown.clone());

    let (tx, mut rx) = mpsc::channel(256);
    let gateway = tokio::spawn(gateway::run(
        Arc::clone(&options),
        rest,
        tx,
        shutdown.clone(),
    ));

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => bot.handle(event),
                None => break,
            },
            () = shutdown.cancelled() => break,
        }
    }

    gateway.await?
}
