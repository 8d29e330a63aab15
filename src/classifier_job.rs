// THEORY:
// The `ClassifierJob` is the final, top-level API of the engine. One job is one attempt
// at training a classifier on the feature vectors produced by a set of chains: it
// partitions the labeled images, computes feature vectors for both partitions, hands
// the training vectors to a trainer and finally scores the resulting model.
//
// Key architectural principles:
// 1.  **Explicit State Machine**: A job walks `Created -> Preparing -> ComputingFeatures
//     -> Training -> Evaluating` and ends in exactly one of `Completed`, `Cancelled` or
//     `Failed`. Every transition is published on a `watch` channel so observers never
//     poll shared fields.
// 2.  **Cooperative Cancellation**: Cancelling only sets a flag. The job checks it at
//     every phase boundary and right after the trainer returns; the trainer polls it
//     while it works. A cancelled job never commits a model.
// 3.  **Outcomes Are States**: Trainer failure and cancellation are job states, not
//     errors. `JobHandle::wait` always yields a `JobReport`.

use crate::config::EngineConfig;
use crate::core_modules::feature_map::feature_map::Size;
use crate::core_modules::image_repository::{Image, ImageId};
use crate::core_modules::trainer::{CancelToken, TrainedModel, Trainer, argmax, distance, one_hot};
use crate::core_modules::transform_chain::TransformChain;
use crate::orchestrator::{ChainSlot, PipelineOrchestrator};
use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum JobState {
    Created,
    Preparing,
    ComputingFeatures,
    Training,
    Evaluating,
    Completed,
    Cancelled,
    Failed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed(_))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => f.write_str("created"),
            JobState::Preparing => f.write_str("preparing"),
            JobState::ComputingFeatures => f.write_str("computing features"),
            JobState::Training => f.write_str("training"),
            JobState::Evaluating => f.write_str("evaluating"),
            JobState::Completed => f.write_str("completed"),
            JobState::Cancelled => f.write_str("cancelled"),
            JobState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Everything a job needs, passed in explicitly.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Identifies what the job trains for; a newer job for the same target supersedes this one.
    pub target: String,
    pub images: Vec<Image>,
    pub chains: Vec<Arc<TransformChain>>,
    /// Prepend the identity slot to every vector.
    pub include_raw: bool,
    pub canonical_size: Size,
    pub positive_only: bool,
    /// Output categories. Empty means every category present in `images`.
    pub categories: Vec<String>,
    pub train_per_category: usize,
    pub error_threshold: f64,
    pub max_seconds: f64,
    pub seed: u64,
}

impl JobSpec {
    pub fn from_config(
        target: impl Into<String>,
        images: Vec<Image>,
        chains: Vec<Arc<TransformChain>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            target: target.into(),
            images,
            chains,
            include_raw: config.include_raw,
            canonical_size: config.canonical_size,
            positive_only: config.positive_only,
            categories: Vec::new(),
            train_per_category: config.train_per_category,
            error_threshold: config.error_threshold,
            max_seconds: config.max_seconds,
            seed: config.seed,
        }
    }

    /// The vector layout: identity first when enabled, then chains in order.
    pub fn slots(&self) -> Vec<ChainSlot> {
        let identity = self.include_raw.then_some(ChainSlot::Identity);
        identity
            .into_iter()
            .chain(self.chains.iter().cloned().map(ChainSlot::Chain))
            .collect()
    }
}

/// The disjoint train/held-out split of a job's images.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    /// Sorted output categories.
    pub categories: Vec<String>,
    pub training: Vec<Image>,
    pub held_out: Vec<Image>,
    /// Requested categories with no images. They get no output slot.
    pub missing: Vec<String>,
}

impl Partition {
    /// Restricts `images` to `requested` categories (all when empty) and draws up to
    /// `train_per_category` training images from each, shuffled by `seed`.
    pub fn split(images: &[Image], requested: &[String], train_per_category: usize, seed: u64) -> Self {
        let mut by_category: BTreeMap<String, Vec<Image>> = BTreeMap::new();
        for image in images {
            if requested.is_empty() || requested.iter().any(|c| c == image.label()) {
                by_category
                    .entry(image.label().to_string())
                    .or_default()
                    .push(image.clone());
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut partition = Partition::default();
        for (category, mut members) in by_category {
            members.sort_by_key(Image::id);
            members.shuffle(&mut rng);
            let held_out = members.split_off(train_per_category.min(members.len()));
            partition.training.extend(members);
            partition.held_out.extend(held_out);
            partition.categories.push(category);
        }

        let mut missing: Vec<String> = requested
            .iter()
            .filter(|c| partition.category_index(c).is_none())
            .cloned()
            .collect();
        missing.sort();
        missing.dedup();
        for category in &missing {
            warn!("requested category '{category}' has no images and is left out");
        }
        partition.missing = missing;
        partition
    }

    fn category_index(&self, label: &str) -> Option<usize> {
        self.categories.binary_search_by(|c| c.as_str().cmp(label)).ok()
    }
}

/// Distance and hit tally over one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Tally {
    pub count: usize,
    pub distance_sum: f64,
    pub hits: usize,
}

impl Tally {
    fn add(&mut self, distance: f64, hit: bool) {
        self.count += 1;
        self.distance_sum += distance;
        if hit {
            self.hits += 1;
        }
    }

    /// Mean distance to the ideal output; 0.0 when empty.
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.distance_sum / self.count as f64
        }
    }

    /// Fraction of images whose strongest output is their own category; 0.0 when empty.
    pub fn accuracy(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.hits as f64 / self.count as f64
        }
    }
}

/// Scores over all, trained and untrained images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PartitionScores {
    pub all: Tally,
    pub trained: Tally,
    pub untrained: Tally,
}

impl PartitionScores {
    fn add(&mut self, outcome: &EvalOutcome) {
        self.all.add(outcome.distance, outcome.hit);
        if outcome.trained {
            self.trained.add(outcome.distance, outcome.hit);
        } else {
            self.untrained.add(outcome.distance, outcome.hit);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryScore {
    pub category: String,
    pub scores: PartitionScores,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreRecord {
    pub categories: Vec<CategoryScore>,
    pub total: PartitionScores,
}

/// The model's verdict on a single image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOutcome {
    pub category: usize,
    pub trained: bool,
    /// Euclidean distance between the model output and the ideal one-hot vector.
    pub distance: f64,
    /// Whether the largest output is at `category`.
    pub hit: bool,
}

impl EvalOutcome {
    pub fn new(output: &[f64], category: usize, categories: usize, trained: bool) -> Self {
        Self {
            category,
            trained,
            distance: distance(output, &one_hot(category, categories)),
            hit: argmax(output) == Some(category),
        }
    }
}

/// Aggregates per-image outcomes into per-category and total scores.
pub fn score(categories: &[String], outcomes: &[EvalOutcome]) -> ScoreRecord {
    let mut per_category: Vec<CategoryScore> = categories
        .iter()
        .map(|category| CategoryScore {
            category: category.clone(),
            scores: PartitionScores::default(),
        })
        .collect();
    let mut total = PartitionScores::default();
    for outcome in outcomes {
        if let Some(entry) = per_category.get_mut(outcome.category) {
            entry.scores.add(outcome);
        }
        total.add(outcome);
    }
    ScoreRecord {
        categories: per_category,
        total,
    }
}

/// Final result of a job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub target: String,
    pub state: JobState,
    pub categories: Vec<String>,
    pub training_ids: Vec<ImageId>,
    pub held_out_ids: Vec<ImageId>,
    /// Present only when `state` is `Completed`.
    pub model: Option<Arc<dyn TrainedModel>>,
    /// Present only when `state` is `Completed`.
    pub score: Option<ScoreRecord>,
}

impl JobReport {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            state: JobState::Created,
            categories: Vec::new(),
            training_ids: Vec::new(),
            held_out_ids: Vec::new(),
            model: None,
            score: None,
        }
    }
}

/// Caller's side of a running job.
#[derive(Debug)]
pub struct JobHandle {
    target: String,
    cancel: CancelToken,
    state_rx: watch::Receiver<JobState>,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Requests cancellation. Has no effect once the job has finished.
    pub fn cancel(&self) {
        if self.state().is_terminal() {
            debug!("job '{}' already finished, ignoring cancel", self.target);
            return;
        }
        info!("cancelling job '{}'", self.target);
        self.cancel.cancel();
    }

    pub fn state(&self) -> JobState {
        self.state_rx.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the job to reach a terminal state.
    pub async fn wait(self) -> JobReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                let mut report = JobReport::new(&self.target);
                report.state = JobState::Failed(format!("job task failed: {e}"));
                report
            }
        }
    }
}

/// Why a job left the happy path.
enum Stop {
    Cancelled,
    Failed(String),
}

pub struct ClassifierJob {
    spec: JobSpec,
    orchestrator: Arc<PipelineOrchestrator>,
    trainer: Arc<dyn Trainer>,
    cancel: CancelToken,
    state_tx: watch::Sender<JobState>,
}

impl ClassifierJob {
    /// Spawns the job onto the current tokio runtime.
    pub fn start(spec: JobSpec, orchestrator: Arc<PipelineOrchestrator>, trainer: Arc<dyn Trainer>) -> JobHandle {
        let (state_tx, state_rx) = watch::channel(JobState::Created);
        let cancel = CancelToken::new();
        let target = spec.target.clone();
        let job = ClassifierJob {
            spec,
            orchestrator,
            trainer,
            cancel: cancel.clone(),
            state_tx,
        };
        JobHandle {
            target,
            cancel,
            state_rx,
            task: tokio::spawn(job.run()),
        }
    }

    async fn run(self) -> JobReport {
        let mut report = JobReport::new(&self.spec.target);
        let state = match self.drive(&mut report).await {
            Ok(()) => JobState::Completed,
            Err(Stop::Cancelled) => JobState::Cancelled,
            // A failure that follows a cancel request is still a cancellation.
            Err(Stop::Failed(reason)) if self.cancel.is_cancelled() => {
                debug!("job '{}' failed after cancel: {}", self.spec.target, reason);
                JobState::Cancelled
            }
            Err(Stop::Failed(reason)) => JobState::Failed(reason),
        };
        if state != JobState::Completed {
            report.model = None;
            report.score = None;
        }
        match &state {
            JobState::Failed(reason) => warn!("job '{}' failed: {}", self.spec.target, reason),
            other => info!("job '{}' {}", self.spec.target, other),
        }
        self.state_tx.send_replace(state.clone());
        report.state = state;
        report
    }

    fn enter(&self, state: JobState) {
        debug!("job '{}' -> {}", self.spec.target, state);
        self.state_tx.send_replace(state);
    }

    fn checkpoint(&self) -> Result<(), Stop> {
        if self.cancel.is_cancelled() {
            Err(Stop::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn drive(&self, report: &mut JobReport) -> Result<(), Stop> {
        let spec = &self.spec;

        self.checkpoint()?;
        self.enter(JobState::Preparing);
        let partition = Partition::split(&spec.images, &spec.categories, spec.train_per_category, spec.seed);
        report.categories = partition.categories.clone();
        report.training_ids = partition.training.iter().map(Image::id).collect();
        report.held_out_ids = partition.held_out.iter().map(Image::id).collect();
        info!(
            "job '{}': {} categories, {} training, {} held out",
            spec.target,
            partition.categories.len(),
            partition.training.len(),
            partition.held_out.len()
        );
        if partition.training.is_empty() {
            return Err(Stop::Failed("no training images".into()));
        }

        self.checkpoint()?;
        self.enter(JobState::ComputingFeatures);
        let slots = spec.slots();
        let all_images: Vec<Image> = partition
            .training
            .iter()
            .chain(&partition.held_out)
            .cloned()
            .collect();
        let generation = self
            .orchestrator
            .warm_cache(&all_images, &slots, spec.canonical_size)
            .await;
        let (mut train_vectors, mut held_vectors) = tokio::try_join!(
            self.orchestrator.evaluate_with(
                &generation,
                &partition.training,
                &slots,
                spec.canonical_size,
                spec.positive_only
            ),
            self.orchestrator.evaluate_with(
                &generation,
                &partition.held_out,
                &slots,
                spec.canonical_size,
                spec.positive_only
            ),
        )
        .map_err(|e| match self.checkpoint() {
            Err(cancelled) => cancelled,
            Ok(()) => Stop::Failed(e.to_string()),
        })?;
        self.checkpoint()?;

        let category_count = partition.categories.len();
        let labeled = |images: &[Image], vectors: &mut HashMap<ImageId, Vec<f64>>| {
            images
                .iter()
                .map(|image| {
                    let vector = vectors
                        .remove(&image.id())
                        .ok_or_else(|| Stop::Failed(format!("no feature vector for image {}", image.id())))?;
                    let category = partition
                        .category_index(image.label())
                        .ok_or_else(|| Stop::Failed(format!("image {} has no category", image.id())))?;
                    Ok::<_, Stop>((vector, category))
                })
                .collect::<Result<Vec<_>, Stop>>()
        };
        let training = labeled(&partition.training, &mut train_vectors)?;
        let held_out = labeled(&partition.held_out, &mut held_vectors)?;

        self.checkpoint()?;
        self.enter(JobState::Training);
        let inputs: Vec<Vec<f64>> = training.iter().map(|(vector, _)| vector.clone()).collect();
        let targets: Vec<Vec<f64>> = training
            .iter()
            .map(|(_, category)| one_hot(*category, category_count))
            .collect();
        let trainer = self.trainer.clone();
        let cancel = self.cancel.clone();
        let (error_threshold, max_seconds) = (spec.error_threshold, spec.max_seconds);
        let trained = tokio::task::spawn_blocking(move || {
            trainer.train(&inputs, &targets, error_threshold, max_seconds, &cancel)
        })
        .await
        .map_err(|e| Stop::Failed(format!("trainer task failed: {e}")))?;
        self.checkpoint()?;
        let model = trained.ok_or_else(|| Stop::Failed("trainer produced no model".into()))?;

        self.enter(JobState::Evaluating);
        let evaluated = model.clone();
        let outcomes: Vec<EvalOutcome> = tokio::task::spawn_blocking(move || {
            training
                .iter()
                .map(|(vector, category)| (vector, *category, true))
                .chain(held_out.iter().map(|(vector, category)| (vector, *category, false)))
                .map(|(vector, category, trained)| {
                    EvalOutcome::new(&evaluated.compute(vector), category, category_count, trained)
                })
                .collect::<Vec<EvalOutcome>>()
        })
        .await
        .map_err(|e| Stop::Failed(format!("evaluation task failed: {e}")))?;
        let record = score(&partition.categories, &outcomes);
        self.checkpoint()?;

        report.model = Some(model);
        report.score = Some(record);
        Ok(())
    }
}
