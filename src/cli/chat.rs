//! CLI `chat` command: send one message and render the streamed reply.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use sluice::client::events::SessionEvent;
use sluice::config::SluiceConfig;
use sluice::protocol::ConversationId;

/// Stream a reply to stdout. Ctrl-c cancels the stream.
pub async fn chat(config: &SluiceConfig, conversation: Option<ConversationId>, message: &str) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
    let controller = sluice::client::http_controller(config, Arc::new(tx))?;

    controller.tokens().preload().await.ok();
    controller.connect(conversation, message)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stdout = std::io::stdout();
    let mut cancelled = false;

    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = &mut ctrl_c, if !cancelled => {
                cancelled = true;
                controller.cancel();
                continue;
            }
        };
        let Some(event) = event else {
            break;
        };

        match event {
            SessionEvent::Fragment(text) => {
                write!(stdout, "{text}").context("failed to write to stdout")?;
                stdout.flush().ok();
            }
            SessionEvent::Completed(message) => {
                writeln!(stdout).ok();
                eprintln!(
                    "[{} · {} tokens · {} ms]",
                    message.model.as_deref().unwrap_or("unknown"),
                    message.token_count,
                    message.latency_ms.unwrap_or_default()
                );
                break;
            }
            SessionEvent::Failed(err) => {
                writeln!(stdout).ok();
                anyhow::bail!("stream failed: {err}");
            }
            SessionEvent::Cancelled => {
                writeln!(stdout).ok();
                eprintln!("cancelled");
                break;
            }
            other => {
                if let Some(status) = other.status_line() {
                    eprintln!("{status}");
                }
            }
        }
    }

    Ok(())
}
