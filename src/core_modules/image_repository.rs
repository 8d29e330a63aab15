// THEORY:
// The `ImageRepository` is the explicit, owned collection of labeled images that
// every job and batch is built from. Nothing in the engine reaches for a global list
// of images; callers hand a repository (or a slice of its records) to whatever needs it.
//
// An `Image` is identity plus label plus a reference to where its pixels live. The
// pixels themselves are never held here; they are decoded on demand by an
// `ImageLoader` and memoized by the `ImageCache`. Once added, an image is immutable
// except for its label.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Stable unique identifier of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub u64);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A labeled image record.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    id: ImageId,
    label: String,
    source: PathBuf,
}

impl Image {
    pub fn new(id: ImageId, label: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            id,
            label: label.into(),
            source: source.into(),
        }
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    /// The category this image belongs to.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Where the loader finds the pixels.
    pub fn source(&self) -> &Path {
        &self.source
    }
}

/// Owned collection of images, ordered by id.
#[derive(Debug, Default, Clone)]
pub struct ImageRepository {
    images: BTreeMap<ImageId, Image>,
    next_id: u64,
}

impl ImageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an image under a freshly allocated id.
    pub fn add(&mut self, label: impl Into<String>, source: impl Into<PathBuf>) -> ImageId {
        let id = ImageId(self.next_id);
        self.next_id += 1;
        self.images.insert(id, Image::new(id, label, source));
        id
    }

    /// Inserts a record created elsewhere. An existing record with the same id is replaced.
    pub fn insert(&mut self, image: Image) -> Option<Image> {
        self.next_id = self.next_id.max(image.id.0 + 1);
        self.images.insert(image.id, image)
    }

    pub fn remove(&mut self, id: ImageId) -> Option<Image> {
        self.images.remove(&id)
    }

    /// Changes an image's category. Returns false when the id is unknown.
    pub fn relabel(&mut self, id: ImageId, label: impl Into<String>) -> bool {
        match self.images.get_mut(&id) {
            Some(image) => {
                image.label = label.into();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: ImageId) -> Option<&Image> {
        self.images.get(&id)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    /// Snapshot of every record, in id order.
    pub fn to_vec(&self) -> Vec<Image> {
        self.images.values().cloned().collect()
    }

    /// Distinct labels, sorted.
    pub fn categories(&self) -> Vec<String> {
        self.group_by_category().into_keys().collect()
    }

    /// Image ids per label, both levels sorted.
    pub fn group_by_category(&self) -> BTreeMap<String, Vec<ImageId>> {
        let mut groups: BTreeMap<String, Vec<ImageId>> = BTreeMap::new();
        for image in self.images.values() {
            groups.entry(image.label.clone()).or_default().push(image.id);
        }
        groups
    }
}
