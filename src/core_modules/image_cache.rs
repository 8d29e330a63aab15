// THEORY:
// The `ImageCache` memoizes the base feature map of every (image, size) pair that the
// active chains need. Many chains share one base map, so decoding and resizing happen
// once per generation instead of once per chain.
//
// Key architectural principles:
// 1.  **Generations, Not Patches**: The cache is a sequence of immutable
//     `CacheGeneration`s. When the current generation is stale it is never repaired;
//     a complete new generation is built in parallel and the reference is swapped in
//     one step. Readers holding an older `Arc<CacheGeneration>` keep a consistent view.
// 2.  **Precise Staleness**: A generation is stale when a required size is missing or
//     when its sorted image id set differs from the current one. Nothing else triggers
//     a rebuild.
// 3.  **Absorbed Failures**: A single image that fails to decode is logged and left
//     out of the generation. Whether that matters is decided by whoever needs it.

use crate::core_modules::errors::PipelineError;
use crate::core_modules::evaluator::BaseLookup;
use crate::core_modules::feature_map::feature_map::{FeatureMap, Size};
use crate::core_modules::image_repository::{Image, ImageId};
use crate::core_modules::loader::ImageLoader;
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// One immutable snapshot of the cache.
#[derive(Debug, Default)]
pub struct CacheGeneration {
    /// Sorted ids of the images this generation was built for.
    image_ids: Vec<ImageId>,
    /// Sizes this generation was built for.
    sizes: BTreeSet<Size>,
    entries: HashMap<(ImageId, Size), Arc<FeatureMap>>,
}

impl CacheGeneration {
    pub fn get(&self, image_id: ImageId, size: Size) -> Option<&Arc<FeatureMap>> {
        self.entries.get(&(image_id, size))
    }

    pub fn image_ids(&self) -> &[ImageId] {
        &self.image_ids
    }

    pub fn sizes(&self) -> &BTreeSet<Size> {
        &self.sizes
    }

    /// Number of (image, size) entries that decoded successfully.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when `sorted_ids` differs from the cached set or any of `sizes` is missing.
    pub fn is_stale(&self, sorted_ids: &[ImageId], sizes: &BTreeSet<Size>) -> bool {
        self.image_ids != sorted_ids || !sizes.is_subset(&self.sizes)
    }
}

impl BaseLookup for CacheGeneration {
    fn base(&self, image_id: ImageId, size: Size) -> Result<Arc<FeatureMap>, PipelineError> {
        self.get(image_id, size)
            .cloned()
            .ok_or(PipelineError::ImageDecode { image_id, size })
    }
}

/// Shared base-map cache. Cheap to read, rebuilt wholesale when stale.
pub struct ImageCache {
    current: RwLock<Arc<CacheGeneration>>,
    /// Serializes rebuilds so concurrent callers do not build the same generation twice.
    rebuild_lock: tokio::sync::Mutex<()>,
    rebuilds: AtomicUsize,
}

impl ImageCache {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CacheGeneration::default())),
            rebuild_lock: tokio::sync::Mutex::new(()),
            rebuilds: AtomicUsize::new(0),
        }
    }

    /// The current generation.
    pub fn snapshot(&self) -> Arc<CacheGeneration> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many full rebuilds have happened so far.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds.load(Ordering::SeqCst)
    }

    /// Returns a generation covering `images` x `sizes`, rebuilding first if the current
    /// one is stale.
    pub async fn ensure(
        &self,
        images: &[Image],
        sizes: &BTreeSet<Size>,
        loader: Arc<dyn ImageLoader>,
    ) -> Arc<CacheGeneration> {
        let _guard = self.rebuild_lock.lock().await;

        let unique: BTreeMap<ImageId, Image> = images
            .iter()
            .map(|image| (image.id(), image.clone()))
            .collect();
        let sorted_ids: Vec<ImageId> = unique.keys().copied().collect();

        let current = self.snapshot();
        if !current.is_stale(&sorted_ids, sizes) {
            debug!("image cache is current ({} entries)", current.len());
            return current;
        }

        info!(
            "rebuilding image cache: {} images x {} sizes",
            sorted_ids.len(),
            sizes.len()
        );
        let start_time = Instant::now();
        let generation = Arc::new(Self::build(unique, sizes.clone(), loader).await);
        info!(
            "image cache rebuilt in {:.2?}: {} of {} entries decoded",
            start_time.elapsed(),
            generation.len(),
            sorted_ids.len() * sizes.len()
        );

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = generation.clone();
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        generation
    }

    async fn build(
        images: BTreeMap<ImageId, Image>,
        sizes: BTreeSet<Size>,
        loader: Arc<dyn ImageLoader>,
    ) -> CacheGeneration {
        let mut tasks = Vec::with_capacity(images.len() * sizes.len());
        for image in images.values() {
            for size in &sizes {
                let image = image.clone();
                let size = *size;
                let loader = loader.clone();
                tasks.push(tokio::task::spawn_blocking(move || {
                    let result = loader.load(&image, size);
                    (image, size, result)
                }));
            }
        }

        let mut entries = HashMap::with_capacity(tasks.len());
        for joined in join_all(tasks).await {
            match joined {
                Ok((image, size, Ok(map))) => {
                    if map.size() != size {
                        warn!(
                            "loader returned {} for image {} at {}; dropping entry",
                            map.size(),
                            image.id(),
                            size
                        );
                        continue;
                    }
                    entries.insert((image.id(), size), Arc::new(map));
                }
                Ok((image, size, Err(e))) => {
                    warn!(
                        "failed to decode image {} ({}) at {}: {}",
                        image.id(),
                        image.source().display(),
                        size,
                        e
                    );
                }
                Err(e) => warn!("image decode task failed: {}", e),
            }
        }

        CacheGeneration {
            image_ids: images.into_keys().collect(),
            sizes,
            entries,
        }
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}
