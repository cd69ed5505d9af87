use std::sync::atomic::{AtomicBool, Ordering};

use sandbox::{OutputSink, OutputTag};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::types::{JobId, Response};

/// Channel on which a caller receives the responses for its requests.
pub type ResponseSender = mpsc::UnboundedSender<Response>;

/// Forwards a job's output lines and its final result to the requesting caller.
///
/// Lines offered after [`finish`](Self::finish) are dropped, so the result is
/// always the last message for the job.
pub struct OutputRouter {
    id: JobId,
    reply: ResponseSender,
    finished: AtomicBool,
}

impl OutputRouter {
    pub fn new(id: JobId, reply: ResponseSender) -> Self {
        Self {
            id,
            reply,
            finished: AtomicBool::new(false),
        }
    }

    /// Deliver the terminal result. Only the first call has any effect.
    pub fn finish(&self, exit_code: i32) {
        if self.finished.swap(true, Ordering::AcqRel) {
            warn!(job_id = self.id, exit_code, "result already delivered");
            return;
        }
        self.send(Response::Result {
            id: self.id,
            exit_code,
        });
    }

    fn send(&self, response: Response) {
        // The caller may have gone away; the job still runs to completion.
        if self.reply.send(response).is_err() {
            trace!(job_id = self.id, "caller disconnected");
        }
    }
}

impl OutputSink for OutputRouter {
    fn line(&self, tag: OutputTag, text: &str) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        self.send(Response::OutputLine {
            id: self.id,
            tag: tag.into(),
            text: text.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LineTag;

    #[test]
    fn forwards_lines_then_result() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = OutputRouter::new(4, tx);

        router.line(OutputTag::Stdout, "hello");
        router.line(OutputTag::Info, "> note");
        router.finish(0);

        assert_eq!(
            rx.try_recv().unwrap(),
            Response::OutputLine {
                id: 4,
                tag: LineTag::Stdout,
                text: "hello".into(),
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Response::OutputLine {
                id: 4,
                tag: LineTag::Info,
                text: "> note".into(),
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Response::Result {
                id: 4,
                exit_code: 0
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn nothing_after_result() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = OutputRouter::new(9, tx);

        router.finish(1);
        router.finish(0);
        router.line(OutputTag::Stderr, "late");

        assert_eq!(
            rx.try_recv().unwrap(),
            Response::Result {
                id: 9,
                exit_code: 1
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disconnected_caller_is_tolerated() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let router = OutputRouter::new(1, tx);
        router.line(OutputTag::Stdout, "nobody listening");
        router.finish(0);
    }
}
