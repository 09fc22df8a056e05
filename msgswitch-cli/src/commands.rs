//! Command execution.

use crate::Commands;
use colored::Colorize;
use msgswitch_client::Client;
use msgswitch_protocol::{Diagnostics, MessageId, MessageKind, QueueSnapshot, TraceBody, TraceEvent};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Payloads longer than this are shortened in listings.
const PREVIEW_LEN: usize = 80;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::List { prefix, filter } => {
            let queues = client.list(&prefix, filter.into()).await?;
            if queues.is_empty() {
                return Ok("No queues".yellow().to_string());
            }
            Ok(queues
                .iter()
                .map(|q| format!("  {}", q.cyan()))
                .collect::<Vec<_>>()
                .join("\n"))
        }

        Commands::Diagnostics => {
            let diagnostics = client.diagnostics().await?;
            Ok(format_diagnostics(&diagnostics))
        }

        Commands::Tail { .. } => {
            let events = client.trace(None, Duration::ZERO).await?;
            if events.is_empty() {
                return Ok("No events".yellow().to_string());
            }
            Ok(events
                .iter()
                .map(format_event)
                .collect::<Vec<_>>()
                .join("\n"))
        }

        Commands::Ack { queue, seq } => {
            let id = MessageId::new(queue, seq);
            client.ack(&id).await?;
            Ok(format!("{} {}", "Acked".green(), id.to_string().cyan()))
        }

        Commands::Destroy { queue } => {
            client.destroy(&queue).await?;
            Ok(format!("{} queue {}", "Destroyed".green(), queue.cyan()))
        }

        Commands::Call {
            queue,
            body,
            file,
            timeout,
        } => {
            let body = read_body(body, file.as_deref()).await?;
            let response = client
                .rpc(&queue, body, timeout.map(Duration::from_secs))
                .await?;
            Ok(response)
        }

        Commands::Shutdown => {
            client.shutdown().await?;
            Ok("Broker is shutting down".green().to_string())
        }
    }
}

/// Picks the request body from `--body`, `--file` or stdin.
async fn read_body(
    body: Option<String>,
    file: Option<&Path>,
) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(body) = body {
        return Ok(body);
    }
    if let Some(path) = file {
        return Ok(tokio::fs::read_to_string(path).await?);
    }
    let mut body = String::new();
    tokio::io::stdin().read_to_string(&mut body).await?;
    Ok(body)
}

fn format_diagnostics(diagnostics: &Diagnostics) -> String {
    let uptime = diagnostics.current_time - diagnostics.start_time;
    let mut output = format!(
        "{}\n  Started: {}\n  Uptime: {}s\n",
        "Broker".bold(),
        diagnostics.start_time.to_rfc3339(),
        uptime.num_seconds()
    );

    for (title, queues) in [
        ("Permanent queues", &diagnostics.permanent_queues),
        ("Transient queues", &diagnostics.transient_queues),
    ] {
        output.push_str(&format!("\n{} ({})\n", title.bold(), queues.len()));
        for queue in queues {
            output.push_str(&format_queue(queue));
        }
    }
    output
}

fn format_queue(queue: &QueueSnapshot) -> String {
    let mut output = format!("  {} [{} waiting]", queue.name.cyan(), queue.contents.len());
    if let Some(expected) = queue.next_transfer_expected {
        output.push_str(&format!(
            " {} {}",
            "polled until".dimmed(),
            expected.format("%H:%M:%S")
        ));
    }
    output.push('\n');
    for (id, entry) in &queue.contents {
        output.push_str(&format!(
            "    {} {} {}\n",
            id.seq,
            entry.time.format("%H:%M:%S%.3f"),
            preview(&entry.message.payload)
        ));
    }
    output
}

/// Formats one trace event as a single line.
pub fn format_event(event: &TraceEvent) -> String {
    let route = format!(
        "{} -> {}",
        event.input.as_deref().unwrap_or("-"),
        event.output.as_deref().unwrap_or("-")
    );
    let body = match &event.body {
        TraceBody::Message { id, message } => match &message.kind {
            MessageKind::Request { reply_to } => format!(
                "{} {} reply_to={} {}",
                "request".yellow(),
                id,
                reply_to,
                preview(&message.payload)
            ),
            MessageKind::Response { origin } => {
                let elapsed = event
                    .processing_time_ms
                    .map(|ms| format!(" ({ms} ms)"))
                    .unwrap_or_default();
                format!(
                    "{} {} to {}{} {}",
                    "response".green(),
                    id,
                    origin,
                    elapsed,
                    preview(&message.payload)
                )
            }
        },
        TraceBody::Ack { id } => format!("{} {}", "ack".dimmed(), id),
    };
    format!(
        "{} {} {} {} {}",
        event.id,
        event.time.format("%H:%M:%S%.3f"),
        event.queue.cyan(),
        route,
        body
    )
}

/// Shortens `payload` to one line of at most [`PREVIEW_LEN`] characters.
fn preview(payload: &str) -> String {
    let line = payload.replace('\n', " ");
    if line.chars().count() <= PREVIEW_LEN {
        return line;
    }
    let mut short: String = line.chars().take(PREVIEW_LEN).collect();
    short.push_str("...");
    short
}
