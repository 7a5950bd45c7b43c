//! Task sources: where tasks come from and where their outcomes go.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::task::{FileInfo, TaskFailure, TaskRecord, TaskResult};

/// Supplies tasks in order and is told how each one ended.
///
/// Called only from the scheduler; implementations must not block.
pub trait TaskSource: Send + 'static {
    fn next_task(&mut self) -> Option<TaskRecord>;

    fn on_task_done(&mut self, task: &TaskRecord, result: &TaskResult);

    fn on_task_failed(&mut self, task: &TaskRecord, failure: &TaskFailure);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done { task: TaskRecord, result: TaskResult },
    Failed { task: TaskRecord, failure: TaskFailure },
}

impl Outcome {
    pub fn frame_no(&self) -> u32 {
        match self {
            Self::Done { task, .. } | Self::Failed { task, .. } => task.frame_no,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Shared view of the outcomes a [`QueueSource`] has recorded.
#[derive(Debug, Clone, Default)]
pub struct OutcomeLog(Arc<Mutex<Vec<Outcome>>>);

impl OutcomeLog {
    fn push(&self, outcome: Outcome) {
        match self.0.lock() {
            Ok(mut log) => log.push(outcome),
            Err(poisoned) => poisoned.into_inner().push(outcome),
        }
    }

    pub fn snapshot(&self) -> Vec<Outcome> {
        match self.0.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory FIFO of tasks that records every outcome.
#[derive(Debug, Default)]
pub struct QueueSource {
    pending: VecDeque<TaskRecord>,
    outcomes: OutcomeLog,
}

impl QueueSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = TaskRecord>) -> Self {
        Self {
            pending: tasks.into_iter().collect(),
            outcomes: OutcomeLog::default(),
        }
    }

    pub fn push(&mut self, task: TaskRecord) {
        self.pending.push_back(task);
    }

    pub fn outcomes(&self) -> OutcomeLog {
        self.outcomes.clone()
    }
}

impl TaskSource for QueueSource {
    fn next_task(&mut self) -> Option<TaskRecord> {
        self.pending.pop_front()
    }

    fn on_task_done(&mut self, task: &TaskRecord, result: &TaskResult) {
        self.outcomes.push(Outcome::Done {
            task: task.clone(),
            result: result.clone(),
        });
    }

    fn on_task_failed(&mut self, task: &TaskRecord, failure: &TaskFailure) {
        self.outcomes.push(Outcome::Failed {
            task: task.clone(),
            failure: failure.clone(),
        });
    }
}

/// Render parameters shared by every frame of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    pub width: u16,
    pub height: u16,
    pub oformat: String,
    pub files: Vec<FileInfo>,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RangeSummary {
    pub rendered: u32,
    pub failed: Vec<u32>,
}

/// Frames `first..=last` of one render job.
pub struct FrameRangeSource {
    job: RenderJob,
    next: Option<u32>,
    last: u32,
    total: u32,
    summary: RangeSummary,
    on_complete: Option<oneshot::Sender<RangeSummary>>,
}

impl FrameRangeSource {
    pub fn new(job: RenderJob, first: u32, last: u32) -> Self {
        let (next, total) = if first <= last {
            (Some(first), last - first + 1)
        } else {
            (None, 0)
        };
        Self {
            job,
            next,
            last,
            total,
            summary: RangeSummary::default(),
            on_complete: None,
        }
    }

    /// Receives the summary once every frame has an outcome.
    pub fn completion(&mut self) -> oneshot::Receiver<RangeSummary> {
        let (tx, rx) = oneshot::channel();
        self.on_complete = Some(tx);
        if self.total == 0 {
            self.complete();
        }
        rx
    }

    fn complete(&mut self) {
        if let Some(tx) = self.on_complete.take() {
            let _ = tx.send(self.summary.clone());
        }
    }

    fn record(&mut self) {
        let seen = self.summary.rendered + self.summary.failed.len() as u32;
        if seen >= self.total {
            tracing::info!(
                rendered = self.summary.rendered,
                failed = self.summary.failed.len(),
                "Frame range complete"
            );
            self.complete();
        }
    }
}

impl TaskSource for FrameRangeSource {
    fn next_task(&mut self) -> Option<TaskRecord> {
        let frame = self.next?;
        self.next = if frame < self.last {
            Some(frame + 1)
        } else {
            None
        };

        let mut task = TaskRecord::new(frame, self.job.width, self.job.height, &self.job.oformat)
            .with_args(self.job.args.clone());
        task.files = self.job.files.clone();
        task.timeout = self.job.timeout;
        Some(task)
    }

    fn on_task_done(&mut self, task: &TaskRecord, result: &TaskResult) {
        tracing::info!(frame = task.frame_no, worker = %result.worker, "Frame rendered");
        self.summary.rendered += 1;
        self.record();
    }

    fn on_task_failed(&mut self, task: &TaskRecord, failure: &TaskFailure) {
        tracing::warn!(frame = task.frame_no, %failure, "Frame failed");
        self.summary.failed.push(task.frame_no);
        self.record();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn job() -> RenderJob {
        RenderJob {
            width: 320,
            height: 240,
            oformat: "png".to_string(),
            files: Vec::new(),
            args: vec!["+Q9".to_string()],
            timeout: Some(Duration::from_secs(60)),
        }
    }

    fn result() -> TaskResult {
        TaskResult {
            worker: "local#1".to_string(),
            exit_code: 0,
            render_time: Duration::from_millis(5),
        }
    }

    #[test]
    fn queue_source_is_fifo_and_records() {
        let mut source = QueueSource::with_tasks([
            TaskRecord::new(1, 1, 1, "png"),
            TaskRecord::new(2, 1, 1, "png"),
        ]);
        let log = source.outcomes();

        let first = source.next_task().unwrap();
        assert_eq!(first.frame_no, 1);
        source.on_task_done(&first, &result());

        let second = source.next_task().unwrap();
        source.on_task_failed(
            &second,
            &TaskFailure::new(&second, ErrorKind::Timeout, "too slow"),
        );
        assert!(source.next_task().is_none());

        let outcomes = log.snapshot();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].is_done());
        assert_eq!(outcomes[1].frame_no(), 2);
    }

    #[test]
    fn frame_range_yields_each_frame_once() {
        let mut source = FrameRangeSource::new(job(), 3, 5);
        let frames: Vec<u32> = std::iter::from_fn(|| source.next_task())
            .map(|t| t.frame_no)
            .collect();
        assert_eq!(frames, vec![3, 4, 5]);
    }

    #[test]
    fn frame_range_copies_job_parameters() {
        let mut source = FrameRangeSource::new(job(), 1, 1);
        let task = source.next_task().unwrap();
        assert_eq!(task.width, 320);
        assert_eq!(task.args, vec!["+Q9".to_string()]);
        assert_eq!(task.timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn frame_range_reports_completion() {
        let mut source = FrameRangeSource::new(job(), 1, 2);
        let mut done = source.completion();

        let a = source.next_task().unwrap();
        let b = source.next_task().unwrap();
        source.on_task_done(&a, &result());
        assert!(done.try_recv().is_err());
        source.on_task_failed(&b, &TaskFailure::new(&b, ErrorKind::RenderFailed, "exit 1"));

        let summary = done.try_recv().unwrap();
        assert_eq!(summary.rendered, 1);
        assert_eq!(summary.failed, vec![2]);
    }

    #[test]
    fn empty_range_completes_immediately() {
        let mut source = FrameRangeSource::new(job(), 5, 4);
        assert!(source.next_task().is_none());
        let mut done = source.completion();
        assert_eq!(done.try_recv().unwrap(), RangeSummary::default());
    }
}
