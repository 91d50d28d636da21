use super::messages::CoordinatorMessage;
use crate::config::DispatchOptions;
use crate::digest::ContentDigest;
use crate::errors::{DispatchError, Result};
use crate::events::{Completion, Failure, Outcome};
use crate::executor::Executor;
use crate::registry::JobTemplate;
use crate::report::{panic_message, BatchSummary, Reporter};
use crate::types::JobDescriptor;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Positions in the job list that share one digest, and so one run.
struct JobGroup {
    descriptor: JobDescriptor,
    digest: ContentDigest,
    indices: Vec<usize>,
}

/// Drives one batch to completion.
pub struct BatchCoordinator {
    inbox: mpsc::UnboundedReceiver<CoordinatorMessage>,
    mailbox: mpsc::UnboundedSender<CoordinatorMessage>,
    completions: mpsc::UnboundedSender<Result<Completion>>,
    executor: Arc<dyn Executor>,
    template: JobTemplate,
    options: DispatchOptions,
    reporter: Reporter,
    cancel: CancellationToken,
    slots: Arc<Semaphore>,
    groups: Vec<JobGroup>,
    queue: VecDeque<usize>,
    running: usize,
    total: usize,
    summary: BatchSummary,
    fatal: Option<DispatchError>,
}

impl BatchCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        jobs: Vec<JobDescriptor>,
        executor: Arc<dyn Executor>,
        template: JobTemplate,
        options: DispatchOptions,
        reporter: Reporter,
        cancel: CancellationToken,
        completions: mpsc::UnboundedSender<Result<Completion>>,
    ) {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let total = jobs.len();
        let groups = group_by_digest(jobs);
        let actor = Self {
            inbox,
            mailbox,
            completions,
            executor,
            template,
            slots: Arc::new(Semaphore::new(options.max_workers)),
            options,
            reporter,
            cancel,
            queue: (0..groups.len()).collect(),
            groups,
            running: 0,
            total,
            summary: BatchSummary::default(),
            fatal: None,
        };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        use self::CoordinatorMessage::*;
        self.reporter
            .batch_started(self.total, self.groups.len(), self.options.max_workers);

        while !self.queue.is_empty() || self.running > 0 {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.queue.is_empty() => {
                    self.cancel_queued();
                }
                Some(msg) = self.inbox.recv() => match msg {
                    Finished { group, result } => self.finished(group, result),
                },
                permit = Arc::clone(&self.slots).acquire_owned(),
                    if !self.queue.is_empty() && !self.cancel.is_cancelled() =>
                {
                    match permit {
                        Ok(permit) => self.start_next(permit),
                        Err(_) => self.cancel_queued(),
                    }
                }
            }
        }

        match self.fatal.take() {
            Some(e) => {
                self.reporter.batch_aborted(&e);
                let _ = self.completions.send(Err(e));
            }
            None => self.reporter.batch_finished(&self.summary),
        }
    }

    fn start_next(&mut self, permit: OwnedSemaphorePermit) {
        let Some(group) = self.queue.pop_front() else {
            return;
        };
        let job = &self.groups[group];
        self.reporter
            .job_started(job.digest.as_str(), &job.descriptor.canonical());

        let invocation = self.template.invocation(job.descriptor.clone());
        let executor = Arc::clone(&self.executor);
        let cancel = self.cancel.child_token();
        let mailbox = self.mailbox.clone();
        self.running += 1;
        tokio::spawn(async move {
            let result = AssertUnwindSafe(executor.execute(invocation, cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Ok(Outcome::failed(Failure::error(format!(
                        "executor panicked: {}",
                        panic_message(panic)
                    ))))
                });
            // the outcome must reach the coordinator before the slot frees up
            let _ = mailbox.send(CoordinatorMessage::Finished { group, result });
            drop(permit);
        });
    }

    fn finished(&mut self, group: usize, result: Result<Outcome>) {
        self.running -= 1;
        match result {
            Ok(outcome) => {
                if self.options.fail_fast && outcome.is_failure() && !self.cancel.is_cancelled() {
                    tracing::warn!(digest = %self.groups[group].digest.short(), "Job failed, cancelling the rest of the batch");
                    self.cancel.cancel();
                }
                self.emit(group, outcome);
            }
            Err(e) => {
                tracing::error!(digest = %self.groups[group].digest.short(), error = %e, "Could not schedule job");
                if self.fatal.is_none() {
                    self.fatal = Some(e);
                }
                self.cancel.cancel();
            }
        }
    }

    fn cancel_queued(&mut self) {
        while let Some(group) = self.queue.pop_front() {
            self.emit(group, Outcome::Cancelled);
        }
    }

    /// Fan one run's outcome out to every position that asked for it.
    fn emit(&mut self, group: usize, outcome: Outcome) {
        let job = &self.groups[group];
        for &index in &job.indices {
            let completion = Completion {
                index,
                descriptor: job.descriptor.clone(),
                outcome: outcome.clone(),
            };
            self.summary.record(&completion.outcome);
            self.reporter.job_finished(&completion, job.digest.short());
            // a dropped receiver already cancelled the batch
            let _ = self.completions.send(Ok(completion));
        }
    }
}

fn group_by_digest(jobs: Vec<JobDescriptor>) -> Vec<JobGroup> {
    let mut groups: Vec<JobGroup> = Vec::new();
    let mut seen: HashMap<ContentDigest, usize> = HashMap::new();
    for (index, descriptor) in jobs.into_iter().enumerate() {
        let digest = descriptor.digest();
        match seen.get(&digest) {
            Some(&group) => groups[group].indices.push(index),
            None => {
                seen.insert(digest.clone(), groups.len());
                groups.push(JobGroup {
                    descriptor,
                    digest,
                    indices: vec![index],
                });
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_share_a_group() {
        let jobs = vec!["a".into(), "b".into(), "a".into()];
        let groups = group_by_digest(jobs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].indices, vec![0, 2]);
        assert_eq!(groups[1].indices, vec![1]);
    }
}
