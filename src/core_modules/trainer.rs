// THEORY:
// The trainer is an external collaborator. The engine hands it fixed-layout input
// vectors and one-hot targets and gets back either a model or nothing. What happens
// in between is the trainer's business; the only contract the engine relies on is
// cooperative cancellation: the trainer polls a `CancelToken` and gives up promptly
// once it is set, and it respects its time budget.
//
// `CentroidTrainer` is a small reference trainer so the engine runs end to end
// without a neural-network backend. It learns one centroid per target class and
// answers with a softmax over negative squared distances, sharpening the softmax
// until the mean training error drops under the requested threshold.

use log::debug;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const MAX_SHARPENING_ROUNDS: usize = 64;

/// Cooperative cancellation flag shared between a job, its handle and its trainer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A trained classifier.
pub trait TrainedModel: Send + Sync {
    /// One output per category.
    fn compute(&self, input: &[f64]) -> Vec<f64>;
}

impl fmt::Debug for dyn TrainedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TrainedModel")
    }
}

/// Produces a model from training vectors. Returns `None` when training does not
/// converge, runs out of time, or is cancelled.
pub trait Trainer: Send + Sync {
    fn train(
        &self,
        inputs: &[Vec<f64>],
        targets: &[Vec<f64>],
        error_threshold: f64,
        max_seconds: f64,
        cancel: &CancelToken,
    ) -> Option<Arc<dyn TrainedModel>>;
}

/// Unit vector of length `len` with a 1.0 at `index`.
pub fn one_hot(index: usize, len: usize) -> Vec<f64> {
    let mut target = vec![0.0; len];
    if index < len {
        target[index] = 1.0;
    }
    target
}

/// Euclidean distance; missing trailing entries count as zero.
pub fn distance(a: &[f64], b: &[f64]) -> f64 {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let d = a.get(i).copied().unwrap_or(0.0) - b.get(i).copied().unwrap_or(0.0);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Index of the largest entry, if any.
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
}

/// When a time budget of `max_seconds` runs out. `None` means no deadline: the budget
/// is infinite, NaN, or too large to represent.
pub fn training_deadline(start: Instant, max_seconds: f64) -> Option<Instant> {
    if max_seconds.is_nan() {
        return None;
    }
    let budget = Duration::try_from_secs_f64(max_seconds.max(0.0)).ok()?;
    start.checked_add(budget)
}

/// Nearest-centroid model with a softmax readout.
#[derive(Debug, Clone)]
pub struct CentroidModel {
    centroids: Vec<Vec<f64>>,
    sharpness: f64,
}

impl CentroidModel {
    pub fn centroids(&self) -> &[Vec<f64>] {
        &self.centroids
    }
}

impl TrainedModel for CentroidModel {
    fn compute(&self, input: &[f64]) -> Vec<f64> {
        if self.centroids.is_empty() {
            return Vec::new();
        }
        let dimension = input.len().max(1) as f64;
        let logits: Vec<f64> = self
            .centroids
            .iter()
            .map(|c| -self.sharpness * distance(input, c).powi(2) / dimension)
            .collect();
        let peak = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = logits.iter().map(|l| (l - peak).exp()).collect();
        let total: f64 = weights.iter().sum();
        weights.into_iter().map(|w| w / total).collect()
    }
}

/// Reference trainer producing a [`CentroidModel`].
#[derive(Debug, Clone, Default)]
pub struct CentroidTrainer;

impl Trainer for CentroidTrainer {
    fn train(
        &self,
        inputs: &[Vec<f64>],
        targets: &[Vec<f64>],
        error_threshold: f64,
        max_seconds: f64,
        cancel: &CancelToken,
    ) -> Option<Arc<dyn TrainedModel>> {
        let classes = targets.first().map(Vec::len)?;
        let dimension = inputs.first().map(Vec::len)?;
        if classes == 0 || inputs.len() != targets.len() {
            return None;
        }

        let mut sums = vec![vec![0.0; dimension]; classes];
        let mut counts = vec![0usize; classes];
        for (input, target) in inputs.iter().zip(targets) {
            let class = argmax(target)?;
            counts[class] += 1;
            for (sum, value) in sums[class].iter_mut().zip(input) {
                *sum += value;
            }
        }
        let centroids = sums
            .into_iter()
            .zip(&counts)
            .map(|(sum, &count)| {
                let n = count.max(1) as f64;
                sum.into_iter().map(|s| s / n).collect()
            })
            .collect();

        let deadline = training_deadline(Instant::now(), max_seconds);
        let mut model = CentroidModel {
            centroids,
            sharpness: 1.0,
        };
        for round in 0..MAX_SHARPENING_ROUNDS {
            if cancel.is_cancelled() {
                debug!("centroid trainer cancelled at round {round}");
                return None;
            }
            if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                debug!("centroid trainer ran out of time at round {round}");
                return None;
            }

            let error = inputs
                .iter()
                .zip(targets)
                .map(|(input, target)| distance(&model.compute(input), target))
                .sum::<f64>()
                / inputs.len() as f64;
            if error <= error_threshold {
                debug!("centroid trainer converged at round {round} with error {error:.4}");
                return Some(Arc::new(model));
            }
            model.sharpness *= 2.0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_hot_and_argmax_agree() {
        let target = one_hot(2, 4);
        assert_eq!(target, vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(argmax(&target), Some(2));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn distance_pads_shorter_vector() {
        assert!((distance(&[3.0], &[0.0, 4.0]) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn centroid_trainer_separates_distinct_classes() {
        let inputs = vec![vec![0.0, 0.0], vec![0.1, 0.0], vec![1.0, 1.0], vec![0.9, 1.0]];
        let targets = vec![one_hot(0, 2), one_hot(0, 2), one_hot(1, 2), one_hot(1, 2)];
        let model = CentroidTrainer
            .train(&inputs, &targets, 0.05, 5.0, &CancelToken::new())
            .expect("training should converge");
        assert_eq!(argmax(&model.compute(&[0.05, 0.0])), Some(0));
        assert_eq!(argmax(&model.compute(&[0.95, 1.0])), Some(1));
    }

    #[test]
    fn centroid_trainer_honours_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let inputs = vec![vec![0.0], vec![1.0]];
        let targets = vec![one_hot(0, 2), one_hot(1, 2)];
        assert!(CentroidTrainer.train(&inputs, &targets, 0.0, 5.0, &token).is_none());
    }

    #[test]
    fn unbounded_budgets_have_no_deadline() {
        let now = Instant::now();
        assert_eq!(training_deadline(now, f64::INFINITY), None);
        assert_eq!(training_deadline(now, 1e20), None);
        assert_eq!(training_deadline(now, f64::NAN), None);
        assert_eq!(training_deadline(now, -3.0), Some(now));
        assert_eq!(training_deadline(now, 2.0), Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn centroid_trainer_runs_with_infinite_budget() {
        let inputs = vec![vec![0.0, 0.0], vec![1.0, 1.0]];
        let targets = vec![one_hot(0, 2), one_hot(1, 2)];
        for budget in [f64::INFINITY, 1e20] {
            let model = CentroidTrainer
                .train(&inputs, &targets, 0.05, budget, &CancelToken::new())
                .expect("training should converge without a deadline");
            assert_eq!(argmax(&model.compute(&[0.0, 0.0])), Some(0));
        }
    }

    #[test]
    fn centroid_trainer_fails_on_inseparable_data() {
        let inputs = vec![vec![0.5], vec![0.5]];
        let targets = vec![one_hot(0, 2), one_hot(1, 2)];
        assert!(
            CentroidTrainer
                .train(&inputs, &targets, 0.01, 5.0, &CancelToken::new())
                .is_none()
        );
    }
}
