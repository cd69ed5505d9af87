use std::process::ExitCode;

use clap::Args;
use sandbox::{OutputSink, OutputTag};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ConfigArgs, Runtime};
use crate::error::{RunnerError, RunnerResult};
use crate::queue::JobQueue;
use crate::router::{OutputRouter, ResponseSender};
use crate::types::{EXIT_REJECTED, Request, Response};

#[derive(Args)]
pub struct ServeArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

/// Read JSON-lines requests from stdin and write JSON-lines responses to stdout.
///
/// EOF, SIGINT or SIGTERM stop intake; queued jobs still run to completion.
pub async fn run_serve(args: ServeArgs) -> RunnerResult<ExitCode> {
    let runtime = Runtime::start(&args.config.config).await?;
    let (reply, responses) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_responses(responses));

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&runtime.queue, &line, &reply).await,
                Ok(None) => {
                    info!("stdin closed, draining");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read request, draining");
                    break;
                }
            },
            () = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, draining");
                break;
            }
            () = recv_signal(&mut sigint) => {
                info!("received SIGINT, draining");
                break;
            }
        }
    }

    runtime.shutdown().await?;
    drop(reply);
    writer
        .await
        .map_err(|e| RunnerError::Internal(format!("writer task: {e}")))??;
    Ok(ExitCode::SUCCESS)
}

async fn handle_line(queue: &JobQueue, line: &str, reply: &ResponseSender) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<Request>(line) {
        Ok(request) => {
            debug!(id = request.id(), "request received");
            queue.submit(request, reply.clone()).await;
        }
        Err(e) => reject_invalid(line, &e, reply),
    }
}

/// Answer an unparseable request with the reserved code, if it carries an id.
fn reject_invalid(line: &str, error: &serde_json::Error, reply: &ResponseSender) {
    let id = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| value.get("id").and_then(serde_json::Value::as_i64));
    let Some(id) = id else {
        warn!(error = %error, "dropping request without id");
        return;
    };
    warn!(id, error = %error, "invalid request");
    let router = OutputRouter::new(id, reply.clone());
    router.line(OutputTag::Info, &format!("invalid request: {error}"));
    router.finish(EXIT_REJECTED);
}

async fn write_responses(mut responses: mpsc::UnboundedReceiver<Response>) -> RunnerResult<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(response) = responses.recv().await {
        let mut json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(e) => {
                warn!(id = response.id(), error = %e, "failed to serialize response");
                continue;
            }
        };
        json.push('\n');
        stdout.write_all(json.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_request_with_id_is_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        reject_invalid(
            r#"{"kind":"runBuild","id":5}"#,
            &serde_json::from_str::<Request>(r#"{"kind":"runBuild","id":5}"#).unwrap_err(),
            &tx,
        );

        assert!(matches!(
            rx.try_recv().unwrap(),
            Response::OutputLine { id: 5, .. }
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            Response::Result {
                id: 5,
                exit_code: EXIT_REJECTED
            }
        );
    }

    #[test]
    fn invalid_request_without_id_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = serde_json::from_str::<Request>("not json").unwrap_err();
        reject_invalid("not json", &err, &tx);
        assert!(rx.try_recv().is_err());
    }
}
