// THEORY:
// The `PipelineOrchestrator` fans a batch out over the full image x chain matrix and
// reassembles one fixed-layout feature vector per image.
//
// Key architectural principles:
// 1.  **Worker Pool**: A fixed number of workers pull units of work from a dispatcher
//     that deals them out round-robin. Each unit carries a one-shot reply channel, so
//     results come back to whoever asked for them regardless of which worker ran them.
// 2.  **Per-Image Wait-All**: An image's vector is assembled only after all of that
//     image's chain units have answered, and always in the order the caller supplied
//     the chain slots. Completion order never leaks into the layout; a classifier
//     downstream depends on each position meaning the same thing for every image.
// 3.  **All or Nothing**: One failed unit aborts the batch. The remaining units see the
//     abort flag and skip their work, and the caller gets the error, never a partial map.

use crate::core_modules::errors::PipelineError;
use crate::core_modules::evaluator::{BaseLookup, postprocess};
use crate::core_modules::feature_map::feature_map::Size;
use crate::core_modules::image_cache::{CacheGeneration, ImageCache};
use crate::core_modules::image_repository::{Image, ImageId};
use crate::core_modules::loader::ImageLoader;
use crate::core_modules::transform_chain::TransformChain;
use futures::future::try_join_all;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// One column of the output vector layout.
#[derive(Debug, Clone)]
pub enum ChainSlot {
    /// No chain: the base image resized straight to the canonical size.
    Identity,
    Chain(Arc<TransformChain>),
}

impl ChainSlot {
    /// The base size this slot reads from the image cache.
    pub fn base_size(&self, canonical_size: Size) -> Size {
        match self {
            ChainSlot::Identity => canonical_size,
            ChainSlot::Chain(chain) => chain.base_size(),
        }
    }
}

impl From<Arc<TransformChain>> for ChainSlot {
    fn from(chain: Arc<TransformChain>) -> Self {
        ChainSlot::Chain(chain)
    }
}

/// A single (slot, image) evaluation.
struct EvalUnit {
    image_id: ImageId,
    slot: ChainSlot,
    generation: Arc<CacheGeneration>,
    canonical_size: Size,
    positive_only: bool,
    batch_aborted: Arc<AtomicBool>,
}

impl EvalUnit {
    fn evaluate(&self) -> Result<Vec<f64>, PipelineError> {
        if self.batch_aborted.load(Ordering::SeqCst) {
            return Err(PipelineError::BatchAborted);
        }
        let map = match &self.slot {
            ChainSlot::Identity => self.generation.base(self.image_id, self.canonical_size)?,
            ChainSlot::Chain(chain) => chain.apply_cached(self.image_id, self.generation.as_ref())?,
        };
        Ok(postprocess(&map, self.canonical_size, self.positive_only).into_values())
    }
}

type UnitResult = Result<Vec<f64>, PipelineError>;

struct EvalTask {
    unit: EvalUnit,
    result_sender: oneshot::Sender<UnitResult>,
}

pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<EvalTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns the dispatcher and `worker_count` workers. Must be called inside a tokio runtime.
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<EvalTask>();
        let mut workers = Vec::with_capacity(worker_count);

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::unbounded_channel::<EvalTask>())
            .unzip();

        // Dispatcher: deal tasks out round-robin.
        tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % worker_count;
            }
        });

        for mut worker_receiver in worker_receivers {
            let worker = tokio::spawn(async move {
                while let Some(task) = worker_receiver.recv().await {
                    let EvalTask { unit, result_sender } = task;
                    if result_sender.is_closed() {
                        continue;
                    }
                    let outcome = tokio::task::spawn_blocking(move || unit.evaluate())
                        .await
                        .unwrap_or_else(|e| Err(PipelineError::TaskFailed(e.to_string())));
                    let _ = result_sender.send(outcome);
                }
            });
            workers.push(worker);
        }

        Self {
            task_sender,
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn submit(&self, unit: EvalUnit) -> Result<oneshot::Receiver<UnitResult>, PipelineError> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.task_sender
            .send(EvalTask { unit, result_sender })
            .map_err(|_| PipelineError::WorkerUnavailable)?;
        Ok(result_receiver)
    }
}

/// Runs batches of (chain, image) evaluations over a shared image cache.
pub struct PipelineOrchestrator {
    cache: Arc<ImageCache>,
    loader: Arc<dyn ImageLoader>,
    worker_pool: WorkerPool,
}

impl PipelineOrchestrator {
    /// Must be called inside a tokio runtime.
    pub fn new(loader: Arc<dyn ImageLoader>, worker_count: usize) -> Self {
        Self::with_cache(Arc::new(ImageCache::new()), loader, worker_count)
    }

    pub fn with_cache(cache: Arc<ImageCache>, loader: Arc<dyn ImageLoader>, worker_count: usize) -> Self {
        Self {
            cache,
            loader,
            worker_pool: WorkerPool::new(worker_count),
        }
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    pub fn worker_count(&self) -> usize {
        self.worker_pool.worker_count()
    }

    /// Distinct base sizes the slots read.
    pub fn required_sizes(slots: &[ChainSlot], canonical_size: Size) -> BTreeSet<Size> {
        slots.iter().map(|slot| slot.base_size(canonical_size)).collect()
    }

    /// Brings the image cache up to date for `images` and the sizes `slots` need.
    pub async fn warm_cache(
        &self,
        images: &[Image],
        slots: &[ChainSlot],
        canonical_size: Size,
    ) -> Arc<CacheGeneration> {
        let sizes = Self::required_sizes(slots, canonical_size);
        self.cache.ensure(images, &sizes, self.loader.clone()).await
    }

    /// Evaluates every slot on every image and returns one vector per image, laid out
    /// in `slots` order. Treats `images` as the current image set for cache staleness.
    pub async fn evaluate_batch(
        &self,
        images: &[Image],
        slots: &[ChainSlot],
        canonical_size: Size,
        positive_only: bool,
    ) -> Result<HashMap<ImageId, Vec<f64>>, PipelineError> {
        let generation = self.warm_cache(images, slots, canonical_size).await;
        self.evaluate_with(&generation, images, slots, canonical_size, positive_only)
            .await
    }

    /// Like [`evaluate_batch`](Self::evaluate_batch) but against a generation the
    /// caller already holds. Lets several batches share one cache warm-up.
    pub async fn evaluate_with(
        &self,
        generation: &Arc<CacheGeneration>,
        images: &[Image],
        slots: &[ChainSlot],
        canonical_size: Size,
        positive_only: bool,
    ) -> Result<HashMap<ImageId, Vec<f64>>, PipelineError> {
        let start_time = Instant::now();
        let batch_aborted = Arc::new(AtomicBool::new(false));

        let mut per_image = Vec::with_capacity(images.len());
        for image in images {
            let mut receivers = Vec::with_capacity(slots.len());
            for slot in slots {
                receivers.push(self.worker_pool.submit(EvalUnit {
                    image_id: image.id(),
                    slot: slot.clone(),
                    generation: generation.clone(),
                    canonical_size,
                    positive_only,
                    batch_aborted: batch_aborted.clone(),
                })?);
            }
            per_image.push((image.id(), receivers));
        }
        debug!(
            "dispatched {} units ({} images x {} slots)",
            images.len() * slots.len(),
            images.len(),
            slots.len()
        );

        let assembled = try_join_all(per_image.into_iter().map(|(image_id, receivers)| {
            let batch_aborted = batch_aborted.clone();
            async move {
                let parts = try_join_all(receivers.into_iter().map(|receiver| async move {
                    receiver
                        .await
                        .map_err(|_| PipelineError::WorkerUnavailable)
                        .and_then(|outcome| outcome)
                }))
                .await
                .inspect_err(|_| batch_aborted.store(true, Ordering::SeqCst))?;
                Ok::<_, PipelineError>((image_id, parts.concat()))
            }
        }))
        .await;

        match assembled {
            Ok(vectors) => {
                info!(
                    "evaluated {} images x {} slots in {:.2?}",
                    images.len(),
                    slots.len(),
                    start_time.elapsed()
                );
                Ok(vectors.into_iter().collect())
            }
            Err(e) => {
                batch_aborted.store(true, Ordering::SeqCst);
                warn!("batch aborted: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::errors::ImageDecodeError;
    use crate::core_modules::feature_map::feature_map::{FeatureMap, Reduction};
    use crate::core_modules::operator::TransformOperator;
    use std::time::Duration;

    /// Loader whose base map for image `n` is filled with `n`.
    struct ValueLoader;

    impl ImageLoader for ValueLoader {
        fn load(&self, image: &Image, size: Size) -> Result<FeatureMap, ImageDecodeError> {
            if image.label() == "corrupt" {
                return Err(ImageDecodeError::Unsupported {
                    message: "corrupt".into(),
                });
            }
            let value = image.id().0 as f64;
            Ok(FeatureMap::from_fn(size, |_, _| value))
        }
    }

    /// Zero-reduction operator that adds a constant after sleeping.
    #[derive(Debug)]
    struct SlowOffset {
        offset: f64,
        delay: Duration,
    }

    impl TransformOperator for SlowOffset {
        fn reduction(&self) -> Reduction {
            (0, 0)
        }

        fn apply(&self, input: &FeatureMap) -> FeatureMap {
            std::thread::sleep(self.delay);
            FeatureMap::from_fn(input.size(), |x, y| input.get(x, y) + self.offset)
        }
    }

    fn slow_chain(offset: f64, delay_ms: u64) -> ChainSlot {
        let operator: Arc<dyn TransformOperator> = Arc::new(SlowOffset {
            offset,
            delay: Duration::from_millis(delay_ms),
        });
        ChainSlot::Chain(Arc::new(
            TransformChain::compose(Size::new(2, 2), vec![operator]).unwrap(),
        ))
    }

    fn images(ids: &[u64]) -> Vec<Image> {
        ids.iter()
            .map(|id| Image::new(ImageId(*id), "circle", format!("{id}.png")))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn layout_follows_slot_order_not_completion_order() {
        let orchestrator = PipelineOrchestrator::new(Arc::new(ValueLoader), 4);
        // The first slot is the slowest, the last the fastest.
        let slots = vec![slow_chain(100.0, 40), slow_chain(200.0, 20), slow_chain(300.0, 0)];
        let batch = images(&[1, 2, 3]);

        for _ in 0..3 {
            let vectors = orchestrator
                .evaluate_batch(&batch, &slots, Size::new(1, 1), false)
                .await
                .unwrap();
            assert_eq!(vectors.len(), 3);
            for image in &batch {
                let n = image.id().0 as f64;
                assert_eq!(vectors[&image.id()], vec![n + 100.0, n + 200.0, n + 300.0]);
            }
        }
    }

    #[tokio::test]
    async fn identity_slot_reads_canonical_size() {
        let orchestrator = PipelineOrchestrator::new(Arc::new(ValueLoader), 2);
        let slots = vec![ChainSlot::Identity, slow_chain(1.0, 0)];
        let vectors = orchestrator
            .evaluate_batch(&images(&[5]), &slots, Size::new(3, 3), false)
            .await
            .unwrap();
        // 9 identity values then the chain output pooled up to 3x3.
        let vector = &vectors[&ImageId(5)];
        assert_eq!(vector.len(), 18);
        assert!(vector[..9].iter().all(|v| *v == 5.0));
        assert!(vector[9..].iter().all(|v| *v == 6.0));
    }

    #[tokio::test]
    async fn positive_only_rectifies_outputs() {
        let orchestrator = PipelineOrchestrator::new(Arc::new(ValueLoader), 2);
        let slots = vec![slow_chain(-10.0, 0)];
        let vectors = orchestrator
            .evaluate_batch(&images(&[1]), &slots, Size::new(2, 2), true)
            .await
            .unwrap();
        assert_eq!(vectors[&ImageId(1)], vec![9.0; 4]);
    }

    #[tokio::test]
    async fn one_failed_image_aborts_the_batch() {
        let orchestrator = PipelineOrchestrator::new(Arc::new(ValueLoader), 2);
        let mut batch = images(&[1, 2]);
        batch.push(Image::new(ImageId(3), "corrupt", "3.png"));
        let result = orchestrator
            .evaluate_batch(&batch, &[slow_chain(0.0, 0)], Size::new(2, 2), false)
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::ImageDecode {
                image_id: ImageId(3),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn shared_generation_across_batches_rebuilds_once() {
        let orchestrator = PipelineOrchestrator::new(Arc::new(ValueLoader), 2);
        let slots = vec![slow_chain(0.0, 0)];
        let all = images(&[1, 2, 3, 4]);
        let generation = orchestrator.warm_cache(&all, &slots, Size::new(2, 2)).await;

        let (left, right) = tokio::join!(
            orchestrator.evaluate_with(&generation, &all[..2], &slots, Size::new(2, 2), false),
            orchestrator.evaluate_with(&generation, &all[2..], &slots, Size::new(2, 2), false),
        );
        assert_eq!(left.unwrap().len(), 2);
        assert_eq!(right.unwrap().len(), 2);
        assert_eq!(orchestrator.cache().rebuild_count(), 1);
    }

    #[test]
    fn required_sizes_are_distinct() {
        let a = Arc::new(TransformChain::empty(Size::new(8, 8)).unwrap());
        let b = Arc::new(TransformChain::empty(Size::new(8, 8)).unwrap());
        let slots = vec![ChainSlot::Identity, a.into(), b.into()];
        let sizes = PipelineOrchestrator::required_sizes(&slots, Size::new(4, 4));
        assert_eq!(sizes.into_iter().collect::<Vec<_>>(), vec![Size::new(4, 4), Size::new(8, 8)]);
    }
}
