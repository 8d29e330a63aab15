// THEORY:
// The `JobSupervisor` keeps at most one live job per target. Submitting a new job for
// a target that already has one signals cancel on the old job before letting go of it,
// so a superseded attempt never keeps training in the background unobserved.

use crate::classifier_job::{ClassifierJob, JobHandle, JobSpec, JobState};
use crate::core_modules::trainer::Trainer;
use crate::orchestrator::PipelineOrchestrator;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

pub struct JobSupervisor {
    orchestrator: Arc<PipelineOrchestrator>,
    trainer: Arc<dyn Trainer>,
    running: HashMap<String, JobHandle>,
}

impl JobSupervisor {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, trainer: Arc<dyn Trainer>) -> Self {
        Self {
            orchestrator,
            trainer,
            running: HashMap::new(),
        }
    }

    /// Starts `spec`, cancelling any job already held for the same target. The
    /// superseded handle is returned so the caller may still await its report.
    pub fn submit(&mut self, spec: JobSpec) -> Option<JobHandle> {
        let previous = self.running.remove(&spec.target);
        if let Some(old) = &previous {
            info!("job for '{}' superseded", spec.target);
            old.cancel();
        }
        let target = spec.target.clone();
        let handle = ClassifierJob::start(spec, self.orchestrator.clone(), self.trainer.clone());
        self.running.insert(target, handle);
        previous
    }

    /// Cancels the job for `target`, if any. The handle stays until taken.
    pub fn cancel(&self, target: &str) -> bool {
        match self.running.get(target) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes and returns the handle for `target`.
    pub fn take(&mut self, target: &str) -> Option<JobHandle> {
        self.running.remove(target)
    }

    pub fn state(&self, target: &str) -> Option<JobState> {
        self.running.get(target).map(JobHandle::state)
    }

    pub fn subscribe(&self, target: &str) -> Option<watch::Receiver<JobState>> {
        self.running.get(target).map(JobHandle::subscribe)
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}
