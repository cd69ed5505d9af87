//! Single-worker FIFO job queue.
//!
//! Requests are appended by any number of producers and consumed one at a time
//! by the worker task, so at most one job ever touches the sandbox. The queue
//! also owns the identity of the running job, which is what cancellation
//! matches against.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use sandbox::{OutputSink, OutputTag};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::router::{OutputRouter, ResponseSender};
use crate::status::{RunnerMode, StatusTracker};
use crate::types::{EXIT_FAILURE, EXIT_REJECTED, JobId, JobKind, Request};

const CANCELLED_BEFORE_START: &str = "> Build cancelled before it started";
const SHUTTING_DOWN: &str = "> Runner is shutting down, request rejected";

/// Executes one job to completion and returns its result code.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, kind: &JobKind, sink: Arc<dyn OutputSink>, cancel: CancellationToken) -> i32;

    /// Terminate whatever the current job is running. No-op when idle.
    fn kill(&self);
}

struct QueuedJob {
    id: JobId,
    kind: JobKind,
    router: Arc<OutputRouter>,
}

struct CurrentJob {
    id: JobId,
    cancelable: bool,
    cancel: CancellationToken,
}

struct QueueState {
    pending: VecDeque<QueuedJob>,
    current: Option<CurrentJob>,
    closed: bool,
}

/// What a [`JobQueue::cancel`] call did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Queued jobs removed before they started.
    pub removed: usize,
    /// Whether the running job was signalled.
    pub killed: bool,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    runner: Arc<dyn JobRunner>,
    status: Option<Arc<StatusTracker>>,
}

impl JobQueue {
    pub fn new(runner: Arc<dyn JobRunner>, status: Option<Arc<StatusTracker>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                current: None,
                closed: false,
            }),
            notify: Notify::new(),
            runner,
            status,
        })
    }

    /// Dispatch a caller request. Responses for it are sent on `reply`.
    pub async fn submit(&self, request: Request, reply: ResponseSender) {
        match request {
            Request::RunBuild { id, spec } => self.enqueue(id, JobKind::RunBuild(spec), reply).await,
            Request::CleanWorkspace { id, spec } => {
                self.enqueue(id, JobKind::CleanWorkspace(spec), reply).await;
            }
            Request::Cancel { id, target } => {
                let outcome = self.cancel(target).await;
                debug!(request_id = id, target, ?outcome, "cancel handled");
            }
        }
    }

    /// Append a job and wake the worker.
    ///
    /// After [`close`](Self::close) the job is rejected immediately with the
    /// reserved code.
    pub async fn enqueue(&self, id: JobId, kind: JobKind, reply: ResponseSender) {
        let router = Arc::new(OutputRouter::new(id, reply));
        {
            let mut state = self.state.lock().await;
            if !state.closed {
                debug!(job_id = id, %kind, queued = state.pending.len(), "job queued");
                state.pending.push_back(QueuedJob { id, kind, router });
                drop(state);
                self.notify.notify_one();
                self.publish_status().await;
                return;
            }
        }
        warn!(job_id = id, "queue closed, rejecting job");
        router.line(OutputTag::Info, SHUTTING_DOWN);
        router.finish(EXIT_REJECTED);
    }

    /// Cancel job `target`.
    ///
    /// Queued matches are removed and answered with the reserved code. A
    /// running match is signalled and still reports its own result. Workspace
    /// cleanups are never matched. Unknown or finished ids are ignored.
    pub async fn cancel(&self, target: JobId) -> CancelOutcome {
        let mut removed = Vec::new();
        let mut killed = false;
        {
            let mut state = self.state.lock().await;
            let mut kept = VecDeque::with_capacity(state.pending.len());
            for job in state.pending.drain(..) {
                if job.id == target && job.kind.is_cancelable() {
                    removed.push(job);
                } else {
                    kept.push_back(job);
                }
            }
            state.pending = kept;

            // Kill under the lock so the signal cannot reach a job started after `target`.
            if let Some(current) = &state.current
                && current.id == target
                && current.cancelable
            {
                info!(job_id = target, "cancelling running job");
                current.cancel.cancel();
                self.runner.kill();
                killed = true;
            }
        }

        for job in &removed {
            info!(job_id = job.id, "removed queued job");
            job.router.line(OutputTag::Info, CANCELLED_BEFORE_START);
            job.router.finish(EXIT_REJECTED);
        }
        if !removed.is_empty() {
            self.publish_status().await;
        }

        CancelOutcome {
            removed: removed.len(),
            killed,
        }
    }

    /// Stop accepting jobs. The worker exits once the queue is drained.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_one();
        if let Some(status) = &self.status {
            status.set_mode(RunnerMode::Draining).await;
        }
    }

    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.worker_loop().await })
    }

    async fn worker_loop(&self) {
        while let Some(job) = self.next_job().await {
            self.publish_status().await;
            let exit_code = self.run_job(&job).await;

            // Clear the slot before the result goes out: a cancel arriving
            // from here on finds nothing to kill.
            self.state.lock().await.current = None;
            job.router.finish(exit_code);
            info!(job_id = job.id, kind = %job.kind, exit_code, "job finished");
            self.publish_status().await;
        }

        info!("queue drained, worker stopping");
        if let Some(status) = &self.status {
            status.set_mode(RunnerMode::Stopped).await;
        }
    }

    /// Wait for the next job and mark it current. `None` once closed and empty.
    async fn next_job(&self) -> Option<QueuedJob> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(job) = state.pending.pop_front() {
                    state.current = Some(CurrentJob {
                        id: job.id,
                        cancelable: job.kind.is_cancelable(),
                        cancel: CancellationToken::new(),
                    });
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn run_job(&self, job: &QueuedJob) -> i32 {
        let cancel = match &self.state.lock().await.current {
            Some(current) => current.cancel.clone(),
            None => CancellationToken::new(),
        };
        info!(job_id = job.id, kind = %job.kind, "job started");

        let runner = Arc::clone(&self.runner);
        let kind = job.kind.clone();
        let sink: Arc<dyn OutputSink> = job.router.clone();
        let task = tokio::spawn(async move { runner.run(&kind, sink, cancel).await });

        match task.await {
            Ok(code) => code,
            Err(e) => {
                error!(job_id = job.id, error = %e, "job task failed");
                job.router
                    .line(OutputTag::Stderr, &format!("internal error: {e}"));
                EXIT_FAILURE
            }
        }
    }

    async fn publish_status(&self) {
        let Some(status) = &self.status else {
            return;
        };
        let (current, queued) = {
            let state = self.state.lock().await;
            (
                state.current.as_ref().map(|c| c.id),
                state.pending.iter().map(|j| j.id).collect(),
            )
        };
        status.set_jobs(current, queued).await;
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};
    use std::time::{Duration, Instant};

    use tokio::sync::mpsc;

    use sandbox_proot::{ProotConfig, ProotSandbox};

    use super::*;
    use crate::executor::{BuildOrchestrator, OrchestratorConfig};
    use crate::types::{BuildSpec, CleanSpec, LineTag, Response};
    use crate::workspace::WorkspaceCache;

    /// Behaviour is chosen by the first build argument:
    /// `block` waits for cancellation, `panic` panics, `fail` returns 1,
    /// anything else sleeps briefly and succeeds.
    struct FakeRunner {
        started: mpsc::UnboundedSender<String>,
        spans: std::sync::Mutex<Vec<(String, Instant, Instant)>>,
        kills: AtomicUsize,
        queue: OnceLock<Weak<JobQueue>>,
        killed_under_lock: AtomicBool,
    }

    impl FakeRunner {
        fn new(started: mpsc::UnboundedSender<String>) -> Arc<Self> {
            Arc::new(Self {
                started,
                spans: std::sync::Mutex::new(Vec::new()),
                kills: AtomicUsize::new(0),
                queue: OnceLock::new(),
                killed_under_lock: AtomicBool::new(false),
            })
        }

        fn attach(&self, queue: &Arc<JobQueue>) {
            let _ = self.queue.set(Arc::downgrade(queue));
        }
    }

    #[async_trait]
    impl JobRunner for FakeRunner {
        async fn run(&self, kind: &JobKind, sink: Arc<dyn OutputSink>, cancel: CancellationToken) -> i32 {
            let label = match kind {
                JobKind::RunBuild(spec) => spec.args.first().cloned().unwrap_or_default(),
                JobKind::CleanWorkspace(_) => "clean".to_string(),
            };
            let start = Instant::now();
            self.started.send(label.clone()).unwrap();
            sink.line(OutputTag::Stdout, &format!("running {label}"));

            let code = match label.as_str() {
                "block" => {
                    tokio::select! {
                        () = cancel.cancelled() => 143,
                        () = tokio::time::sleep(Duration::from_secs(10)) => 0,
                    }
                }
                "panic" => panic!("job blew up"),
                "fail" => 1,
                _ => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    0
                }
            };
            self.spans.lock().unwrap().push((label, start, Instant::now()));
            code
        }

        fn kill(&self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
            if let Some(queue) = self.queue.get().and_then(Weak::upgrade) {
                self.killed_under_lock
                    .store(queue.state.try_lock().is_err(), Ordering::SeqCst);
            }
        }
    }

    struct Harness {
        queue: Arc<JobQueue>,
        runner: Arc<FakeRunner>,
        started: mpsc::UnboundedReceiver<String>,
        reply: ResponseSender,
        responses: mpsc::UnboundedReceiver<Response>,
        worker: JoinHandle<()>,
    }

    fn harness() -> Harness {
        let (started_tx, started) = mpsc::unbounded_channel();
        let runner = FakeRunner::new(started_tx);
        let queue = JobQueue::new(runner.clone(), None);
        runner.attach(&queue);
        let worker = queue.spawn_worker();
        let (reply, responses) = mpsc::unbounded_channel();
        Harness {
            queue,
            runner,
            started,
            reply,
            responses,
            worker,
        }
    }

    fn build(label: &str) -> JobKind {
        JobKind::RunBuild(BuildSpec {
            args: vec![label.to_string()],
            project_path: PathBuf::from("/ext/proj"),
            build_dir: "android/build".into(),
        })
    }

    fn clean() -> JobKind {
        JobKind::CleanWorkspace(CleanSpec {
            project_path: PathBuf::from("/ext/proj"),
            build_dir: "android/build".into(),
            force_clean: true,
        })
    }

    /// Collect every response for `id` up to and including its result.
    async fn responses_for(rx: &mut mpsc::UnboundedReceiver<Response>, id: JobId) -> (Vec<Response>, i32) {
        let mut lines = Vec::new();
        loop {
            let response = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for response")
                .expect("channel closed");
            match response {
                Response::Result { id: rid, exit_code } if rid == id => return (lines, exit_code),
                other if other.id() == id => lines.push(other),
                _ => {}
            }
        }
    }

    async fn wait_started(h: &mut Harness, label: &str) {
        let got = tokio::time::timeout(Duration::from_secs(5), h.started.recv())
            .await
            .expect("timed out waiting for job start")
            .unwrap();
        assert_eq!(got, label);
    }

    #[tokio::test]
    async fn jobs_run_in_fifo_order_without_overlap() {
        let mut h = harness();
        for (id, label) in [(1, "a"), (2, "b"), (3, "c")] {
            h.queue.enqueue(id, build(label), h.reply.clone()).await;
        }

        let mut codes = Vec::new();
        for id in 1..=3 {
            codes.push(responses_for(&mut h.responses, id).await.1);
        }
        assert_eq!(codes, vec![0, 0, 0]);

        let spans = h.runner.spans.lock().unwrap().clone();
        let labels: Vec<&str> = spans.iter().map(|(l, _, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
        for pair in spans.windows(2) {
            assert!(pair[1].1 >= pair[0].2, "jobs overlapped");
        }
    }

    #[tokio::test]
    async fn output_precedes_result() {
        let mut h = harness();
        h.queue.enqueue(1, build("fail"), h.reply.clone()).await;

        let (lines, code) = responses_for(&mut h.responses, 1).await;
        assert_eq!(code, 1);
        assert!(matches!(
            &lines[..],
            [Response::OutputLine { text, .. }] if text == "running fail"
        ));
    }

    #[tokio::test]
    async fn submit_dispatches_requests() {
        let mut h = harness();
        let request: Request = serde_json::from_str(
            r#"{"kind":"runBuild","id":1,"args":["tasks"],"projectPath":"/ext/proj","buildDir":"android/build"}"#,
        )
        .unwrap();
        h.queue.submit(request, h.reply.clone()).await;

        let (_, code) = responses_for(&mut h.responses, 1).await;
        assert!(code == 0 || code == 1);
    }

    #[tokio::test]
    async fn cancel_queued_job_reports_rejection() {
        let mut h = harness();
        h.queue.enqueue(1, build("block"), h.reply.clone()).await;
        wait_started(&mut h, "block").await;
        h.queue.enqueue(2, build("b"), h.reply.clone()).await;

        let outcome = h.queue.cancel(2).await;
        assert_eq!(outcome, CancelOutcome { removed: 1, killed: false });

        let (lines, code) = responses_for(&mut h.responses, 2).await;
        assert_eq!(code, EXIT_REJECTED);
        assert!(matches!(
            &lines[..],
            [Response::OutputLine { text, .. }] if text == CANCELLED_BEFORE_START
        ));

        // Release the blocker; job 2 never runs.
        h.queue.cancel(1).await;
        responses_for(&mut h.responses, 1).await;
        h.queue.close().await;
        h.worker.await.unwrap();
        let labels: Vec<String> = h.runner.spans.lock().unwrap().iter().map(|s| s.0.clone()).collect();
        assert_eq!(labels, vec!["block"]);
    }

    #[tokio::test]
    async fn cancel_running_job_kills_and_still_reports() {
        let mut h = harness();
        h.queue.enqueue(1, build("block"), h.reply.clone()).await;
        wait_started(&mut h, "block").await;

        let outcome = h.queue.cancel(1).await;
        assert_eq!(outcome, CancelOutcome { removed: 0, killed: true });
        assert_eq!(h.runner.kills.load(Ordering::SeqCst), 1);
        assert!(
            h.runner.killed_under_lock.load(Ordering::SeqCst),
            "kill must happen while the running job is still current"
        );

        let (_, code) = responses_for(&mut h.responses, 1).await;
        assert_eq!(code, 143);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_no_op() {
        let mut h = harness();
        h.queue.enqueue(1, build("a"), h.reply.clone()).await;
        responses_for(&mut h.responses, 1).await;

        let outcome = h.queue.cancel(1).await;
        assert_eq!(outcome, CancelOutcome::default());
        assert_eq!(h.runner.kills.load(Ordering::SeqCst), 0);

        // Queue still works afterwards.
        h.queue.enqueue(2, build("b"), h.reply.clone()).await;
        assert_eq!(responses_for(&mut h.responses, 2).await.1, 0);
    }

    #[tokio::test]
    async fn cleanup_is_never_cancelled() {
        let mut h = harness();
        h.queue.enqueue(1, build("block"), h.reply.clone()).await;
        wait_started(&mut h, "block").await;
        h.queue.enqueue(2, clean(), h.reply.clone()).await;

        assert_eq!(h.queue.cancel(2).await, CancelOutcome::default());

        h.queue.cancel(1).await;
        responses_for(&mut h.responses, 1).await;
        wait_started(&mut h, "clean").await;
        assert_eq!(h.queue.cancel(2).await, CancelOutcome::default());
        assert_eq!(responses_for(&mut h.responses, 2).await.1, 0);
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_worker() {
        let mut h = harness();
        h.queue.enqueue(1, build("panic"), h.reply.clone()).await;
        h.queue.enqueue(2, build("b"), h.reply.clone()).await;

        let (lines, code) = responses_for(&mut h.responses, 1).await;
        assert_eq!(code, EXIT_FAILURE);
        assert!(lines.iter().any(|r| matches!(
            r,
            Response::OutputLine { tag: LineTag::Stderr, text, .. } if text.contains("internal error")
        )));
        assert_eq!(responses_for(&mut h.responses, 2).await.1, 0);
    }

    #[tokio::test]
    async fn close_drains_then_rejects() {
        let mut h = harness();
        h.queue.enqueue(1, build("a"), h.reply.clone()).await;
        h.queue.enqueue(2, build("b"), h.reply.clone()).await;
        h.queue.close().await;

        assert_eq!(responses_for(&mut h.responses, 1).await.1, 0);
        assert_eq!(responses_for(&mut h.responses, 2).await.1, 0);
        tokio::time::timeout(Duration::from_secs(5), &mut h.worker)
            .await
            .expect("worker did not stop")
            .unwrap();

        h.queue.enqueue(3, build("c"), h.reply.clone()).await;
        let (lines, code) = responses_for(&mut h.responses, 3).await;
        assert_eq!(code, EXIT_REJECTED);
        assert_eq!(lines.len(), 1);
    }

    #[tokio::test]
    async fn status_file_tracks_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let status = Arc::new(StatusTracker::new(path.clone()));
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let runner = FakeRunner::new(started_tx);
        let queue = JobQueue::new(runner, Some(status));
        let worker = queue.spawn_worker();
        let (reply, mut responses) = mpsc::unbounded_channel();

        queue.enqueue(1, build("block"), reply.clone()).await;
        assert_eq!(started.recv().await.unwrap(), "block");
        queue.enqueue(2, build("b"), reply.clone()).await;

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["current_job"], 1);
        assert_eq!(value["queued_jobs"], serde_json::json!([2]));

        queue.cancel(1).await;
        responses_for(&mut responses, 1).await;
        responses_for(&mut responses, 2).await;
        queue.close().await;
        worker.await.unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["mode"], "stopped");
        assert!(value["current_job"].is_null());
    }

    /// Stands in for proot: enters the host directory bound at the work dir,
    /// drops the sandbox flags and runs `/usr/bin/env ...` on the host.
    const FAKE_PROOT: &str = "#!/bin/sh\n\
        work=\n\
        dir=\n\
        while [ \"$#\" -gt 0 ] && [ \"$1\" != /usr/bin/env ]; do\n\
          case \"$1\" in\n\
            -w) work=\"$2\"; shift ;;\n\
            -b) case \"$2\" in *:\"$work\") dir=\"${2%:*}\" ;; esac; shift ;;\n\
          esac\n\
          shift\n\
        done\n\
        [ -n \"$dir\" ] && cd \"$dir\"\n\
        exec \"$@\"\n";

    /// Gradle wrapper used by the full-stack tests: `slow` sleeps then fails,
    /// anything else prints a task line and succeeds.
    const GRADLEW: &str = "case \"$1\" in\n\
          slow) sleep 3; exit 1 ;;\n\
        esac\n\
        echo \"> Task :$1\"\n\
        echo BUILD SUCCESSFUL\n";

    fn write_executable(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Queue wired to a real orchestrator, workspace cache and sandbox.
    async fn full_stack(dir: &Path) -> (Arc<JobQueue>, JoinHandle<()>) {
        let proot = dir.join("proot");
        write_executable(&proot, FAKE_PROOT);
        let rootfs = dir.join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        std::fs::write(rootfs.join("env"), "PATH=/usr/bin:/bin\n").unwrap();
        std::fs::write(rootfs.join(".ready"), b"").unwrap();

        let build_dir = dir.join("ext/proj/android/build");
        std::fs::create_dir_all(&build_dir).unwrap();
        write_executable(&build_dir.join("gradlew"), GRADLEW);

        let base = dir.join("base");
        let sandbox = ProotSandbox::new(ProotConfig {
            binary_path: proot,
            loader_dir: dir.join("lib"),
            rootfs_path: rootfs,
            base_dir: base.clone(),
        })
        .await
        .unwrap();
        let orchestrator = BuildOrchestrator::new(
            Arc::new(sandbox),
            WorkspaceCache::new(base.join("workspaces")),
            OrchestratorConfig {
                documents_dir: None,
                clear_after_build: false,
            },
        );

        let queue = JobQueue::new(Arc::new(orchestrator), None);
        let worker = queue.spawn_worker();
        (queue, worker)
    }

    fn run_build_request(id: JobId, arg: &str, dir: &Path) -> Request {
        Request::RunBuild {
            id,
            spec: BuildSpec {
                args: vec![arg.to_string()],
                project_path: dir.join("ext/proj"),
                build_dir: "android/build".into(),
            },
        }
    }

    #[tokio::test]
    async fn build_streams_output_then_one_result() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, worker) = full_stack(dir.path()).await;
        let (reply, mut responses) = mpsc::unbounded_channel();

        queue.submit(run_build_request(1, "tasks", dir.path()), reply.clone()).await;
        let (lines, code) = responses_for(&mut responses, 1).await;
        assert!(code == 0 || code == 1, "unexpected code {code}");
        assert!(lines.iter().any(|r| matches!(
            r,
            Response::OutputLine { tag: LineTag::Stdout, text, .. } if text == "> Task :tasks"
        )));

        queue.close().await;
        tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .expect("worker did not stop")
            .unwrap();
        drop(reply);
        let mut extra = Vec::new();
        while let Some(response) = responses.recv().await {
            extra.push(response);
        }
        assert!(extra.is_empty(), "responses after result: {extra:?}");
    }

    #[tokio::test]
    async fn immediate_cancel_ends_with_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, worker) = full_stack(dir.path()).await;
        let (reply, mut responses) = mpsc::unbounded_channel();

        queue.submit(run_build_request(2, "slow", dir.path()), reply.clone()).await;
        queue.submit(Request::Cancel { id: 3, target: 2 }, reply.clone()).await;

        let (_, code) = responses_for(&mut responses, 2).await;
        assert_ne!(code, 0);

        queue.close().await;
        tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
