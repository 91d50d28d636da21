//! Bounded concurrent dispatch.
//!
//! A [`Dispatcher`] runs a list of job descriptors through an [`Executor`] with at
//! most `max_workers` in flight. Each job's failure stays its own. The batch still
//! yields one completion per input position.

use crate::actors::coordinator::BatchCoordinator;
use crate::config::DispatchOptions;
use crate::errors::Result;
use crate::events::{Completion, Outcome};
use crate::executor::Executor;
use crate::registry::JobTemplate;
use crate::report::{BatchReport, Reporter};
use crate::types::JobDescriptor;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn Executor>,
    options: DispatchOptions,
    reporter: Reporter,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new<E: Executor>(executor: E, options: DispatchOptions, reporter: Reporter) -> Result<Self> {
        Self::from_arc(Arc::new(executor), options, reporter)
    }

    pub fn from_arc(
        executor: Arc<dyn Executor>,
        options: DispatchOptions,
        reporter: Reporter,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            executor,
            options,
            reporter,
            cancel: CancellationToken::new(),
        })
    }

    /// Batches dispatched from here on stop when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Yield completions as they happen.
    ///
    /// Dropping the returned stream cancels whatever is still queued or running.
    pub fn dispatch_streaming(&self, jobs: Vec<JobDescriptor>, template: &JobTemplate) -> Completions {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let total = jobs.len();
        let reporter = self.reporter.next_batch();
        BatchCoordinator::spawn(
            jobs,
            Arc::clone(&self.executor),
            template.clone(),
            self.options.clone(),
            reporter.clone(),
            cancel.clone(),
            tx,
        );
        Completions {
            rx,
            total,
            reporter,
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
        }
    }

    /// Wait for the whole batch. `outcomes[i]` belongs to `jobs[i]`.
    pub async fn dispatch_ordered(
        &self,
        jobs: Vec<JobDescriptor>,
        template: &JobTemplate,
    ) -> Result<BatchReport> {
        let mut slots: Vec<Option<Completion>> = vec![None; jobs.len()];
        let mut completions = self.dispatch_streaming(jobs.clone(), template);
        while let Some(completion) = completions.next().await {
            let completion = completion?;
            let index = completion.index;
            slots[index] = Some(completion);
        }
        let completions = slots
            .into_iter()
            .zip(jobs)
            .enumerate()
            .map(|(index, (slot, descriptor))| {
                slot.unwrap_or(Completion {
                    index,
                    descriptor,
                    outcome: Outcome::Cancelled,
                })
            })
            .collect();
        Ok(BatchReport::new(completions))
    }
}

/// Completions of one batch, in the order they happen.
///
/// A scheduling failure arrives as a final `Err` item, after in-flight jobs have
/// been torn down.
pub struct Completions {
    rx: mpsc::UnboundedReceiver<Result<Completion>>,
    total: usize,
    reporter: Reporter,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl Completions {
    /// Number of jobs in the batch.
    pub fn total(&self) -> usize {
        self.total
    }

    /// This batch's logging context.
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Stop the batch. Completions for everything that was pending still arrive.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for Completions {
    type Item = Result<Completion>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
