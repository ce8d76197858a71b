//! Semantic index over filesystem paths.
//!
//! [`PathIndex`] embeds path strings, keeps them in a [`VectorIndex`] keyed by
//! ordinal ID and persists every committed state through [`IndexStore`]. The
//! list of paths and the vectors are always persisted and reloaded together.

pub mod flat;
pub mod storage;


use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::embeddings::Embedder;

pub use flat::FlatIndex;
pub use storage::{IndexStore, Manifest};

/// Nearest-neighbour structure over fixed-dimension vectors.
///
/// Vectors are addressed by ordinal ID, the order in which they were added.
pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;

    fn len(&self) -> usize;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError>;

    /// The `min(k, len)` closest vectors as `(ordinal, distance)`, ascending by
    /// distance with ties broken by ordinal.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>, IndexError>;
}

/// Creates an empty [`VectorIndex`] of the given dimension.
pub type VectorIndexFactory = fn(usize) -> Box<dyn VectorIndex>;

fn flat_index(dimension: usize) -> Box<dyn VectorIndex> {
    Box::new(FlatIndex::new(dimension))
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Embedding error: {0}")]
    Embedding(#[source] anyhow::Error),

    #[error("Index storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("Vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index lock poisoned by a panicked thread")]
    LockPoisoned,
}

/// One retrieved path.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalHit {
    pub path: String,
    /// Cosine distance in `[0, 2]`.
    pub distance: f32,
}

impl RetrievalHit {
    #[inline]
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub indexed: usize,
    /// Input entries dropped because they repeated an earlier one.
    pub duplicates: usize,
    pub generation: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub added: usize,
    /// Input entries that were already indexed or repeated within the input.
    pub duplicates: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexState {
    Unloaded,
    LoadFailed,
    Ready,
}

pub struct PathIndex {
    embedder: Box<dyn Embedder>,
    store: IndexStore,
    batch_size: usize,
    new_index: VectorIndexFactory,
    vectors: Box<dyn VectorIndex>,
    paths: Vec<String>,
    known: HashSet<String>,
    manifest: Option<Manifest>,
    state: IndexState,
    show_progress: bool,
}

impl std::fmt::Debug for PathIndex {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathIndex")
            .field("model", &self.embedder.model_id())
            .field("store", &self.store)
            .field("len", &self.paths.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PathIndex {
    #[inline]
    pub fn new(embedder: Box<dyn Embedder>, store: IndexStore, batch_size: usize) -> Self {
        let dimension = embedder.dimension();
        Self {
            embedder,
            store,
            batch_size: batch_size.max(1),
            new_index: flat_index,
            vectors: flat_index(dimension),
            paths: Vec::new(),
            known: HashSet::new(),
            manifest: None,
            state: IndexState::Unloaded,
            show_progress: false,
        }
    }

    /// Use a different nearest-neighbour structure than [`FlatIndex`].
    #[inline]
    pub fn with_vector_index(mut self, factory: VectorIndexFactory) -> Self {
        self.new_index = factory;
        self.vectors = factory(self.embedder.dimension());
        self
    }

    /// Draw a progress bar on stderr while embedding.
    #[inline]
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Whether a build or load has succeeded.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == IndexState::Ready
    }

    /// Indexed paths in ordinal order.
    #[inline]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    #[inline]
    pub fn contains(&self, path: &str) -> bool {
        self.known.contains(path)
    }

    #[inline]
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    #[inline]
    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    #[inline]
    pub fn model_id(&self) -> &str {
        self.embedder.model_id()
    }

    /// Embed `paths` into a new generation and make it current.
    ///
    /// Duplicates are dropped, first occurrence wins. The previous state stays
    /// in place, on disk and in memory, unless the whole build succeeds.
    #[inline]
    pub fn build(&mut self, paths: &[String]) -> Result<BuildReport, IndexError> {
        let started = Instant::now();
        let mut known = HashSet::with_capacity(paths.len());
        let unique: Vec<String> = paths
            .iter()
            .filter(|path| known.insert(path.as_str()))
            .cloned()
            .collect();
        let known: HashSet<String> = unique.iter().cloned().collect();
        let duplicates = paths.len() - unique.len();

        info!(
            "Building index over {} paths ({} duplicates dropped)",
            unique.len(),
            duplicates
        );

        let dimension = self.embedder.dimension();
        let mut writer = self
            .store
            .begin_generation(self.embedder.model_id(), dimension)
            .map_err(IndexError::Storage)?;
        let mut vectors = (self.new_index)(dimension);

        let bar = self.progress_bar(unique.len(), "Indexing");
        for batch in unique.chunks(self.batch_size) {
            let embeddings = self.embed_batch(batch)?;
            writer
                .append(batch, &embeddings)
                .map_err(IndexError::Storage)?;
            vectors.add(&embeddings)?;
            bar.inc(batch.len() as u64);
            debug!("Indexed {}/{} paths", writer.count(), unique.len());
        }
        bar.finish_and_clear();

        let manifest = writer.commit().map_err(IndexError::Storage)?;

        let report = BuildReport {
            indexed: unique.len(),
            duplicates,
            generation: manifest.generation,
            elapsed: started.elapsed(),
        };

        self.vectors = vectors;
        self.paths = unique;
        self.known = known;
        self.manifest = Some(manifest);
        self.state = IndexState::Ready;

        info!(
            "Index built with {} paths in {:.2?}",
            report.indexed, report.elapsed
        );
        Ok(report)
    }

    /// Restore the committed generation.
    ///
    /// Returns `false` and leaves the current state untouched when nothing is
    /// persisted or what is persisted cannot be used with this embedder.
    #[inline]
    pub fn load(&mut self) -> bool {
        if self.state != IndexState::Ready {
            self.state = IndexState::LoadFailed;
        }

        let snapshot = match self.store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!("No persisted index in {}", self.store.dir().display());
                return false;
            }
            Err(e) => {
                warn!("Persisted index is unusable: {e:#}");
                return false;
            }
        };

        let manifest = &snapshot.manifest;
        if manifest.model != self.embedder.model_id()
            || manifest.dimension != self.embedder.dimension()
        {
            warn!(
                "Persisted index was built with {} ({} dimensions), current embedder is {} ({} dimensions)",
                manifest.model,
                manifest.dimension,
                self.embedder.model_id(),
                self.embedder.dimension()
            );
            return false;
        }

        if manifest.dimension == 0 {
            warn!("Persisted index has zero dimensions");
            return false;
        }

        let known: HashSet<String> = snapshot.paths.iter().cloned().collect();
        if known.len() != snapshot.paths.len() {
            warn!("Persisted index contains duplicate paths");
            return false;
        }

        let mut vectors = (self.new_index)(manifest.dimension);
        for rows in snapshot
            .vectors
            .chunks(manifest.dimension * self.batch_size)
        {
            let batch: Vec<Vec<f32>> = rows
                .chunks_exact(manifest.dimension)
                .map(<[f32]>::to_vec)
                .collect();
            if let Err(e) = vectors.add(&batch) {
                warn!("Persisted vectors are unusable: {e}");
                return false;
            }
        }

        if vectors.len() != snapshot.paths.len() {
            warn!(
                "Persisted index has {} vectors for {} paths",
                vectors.len(),
                snapshot.paths.len()
            );
            return false;
        }

        info!(
            "Loaded index generation {} with {} paths",
            manifest.generation,
            snapshot.paths.len()
        );

        self.vectors = vectors;
        self.paths = snapshot.paths;
        self.known = known;
        self.manifest = Some(snapshot.manifest);
        self.state = IndexState::Ready;
        true
    }

    /// The `k` indexed paths closest to `query`, ascending by distance.
    ///
    /// An index that was never built or loaded tries to load once; when that
    /// fails the result is empty.
    #[inline]
    pub fn search(&mut self, query: &str, k: usize) -> Result<Vec<RetrievalHit>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        if self.state == IndexState::Unloaded {
            self.load();
        }

        if self.paths.is_empty() {
            debug!("Search on an empty index");
            return Ok(Vec::new());
        }

        let embedding = self
            .embedder
            .embed(&[query.to_string()])
            .map_err(IndexError::Embedding)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                IndexError::Embedding(anyhow::anyhow!("Embedder returned no vector for query"))
            })?;

        let hits = self
            .vectors
            .search(&embedding, k)?
            .into_iter()
            .filter_map(|(id, distance)| {
                self.paths.get(id).map(|path| RetrievalHit {
                    path: path.clone(),
                    distance,
                })
            })
            .collect();

        Ok(hits)
    }

    /// Append the paths that are not indexed yet.
    ///
    /// The delta is persisted and committed before it becomes visible in
    /// memory. Before any successful build or load this does nothing.
    #[inline]
    pub fn update(&mut self, new_paths: &[String]) -> Result<UpdateReport, IndexError> {
        if new_paths.is_empty() {
            return Ok(UpdateReport::default());
        }

        if self.state == IndexState::Unloaded {
            self.load();
        }

        let Some(manifest) = self.manifest.as_ref().filter(|_| self.is_ready()) else {
            warn!(
                "Ignoring update of {} paths: index has not been built",
                new_paths.len()
            );
            return Ok(UpdateReport::default());
        };

        let mut seen = HashSet::new();
        let delta: Vec<String> = new_paths
            .iter()
            .filter(|path| !self.known.contains(path.as_str()) && seen.insert(path.as_str()))
            .cloned()
            .collect();
        let duplicates = new_paths.len() - delta.len();

        if delta.is_empty() {
            debug!("Update found nothing new among {} paths", new_paths.len());
            return Ok(UpdateReport {
                added: 0,
                duplicates,
            });
        }

        let mut writer = self
            .store
            .append_to(manifest)
            .map_err(IndexError::Storage)?;

        let bar = self.progress_bar(delta.len(), "Updating");
        let mut staged = Vec::with_capacity(delta.len());
        for batch in delta.chunks(self.batch_size) {
            let embeddings = self.embed_batch(batch)?;
            writer
                .append(batch, &embeddings)
                .map_err(IndexError::Storage)?;
            staged.extend(embeddings);
            bar.inc(batch.len() as u64);
        }
        bar.finish_and_clear();

        let manifest = writer.commit().map_err(IndexError::Storage)?;

        self.vectors.add(&staged)?;
        self.known.extend(delta.iter().cloned());
        self.paths.extend(delta);
        self.manifest = Some(manifest);

        let report = UpdateReport {
            added: staged.len(),
            duplicates,
        };
        info!(
            "Index updated with {} new paths ({} already known)",
            report.added, report.duplicates
        );
        Ok(report)
    }

    fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let embeddings = self.embedder.embed(batch).map_err(IndexError::Embedding)?;

        if embeddings.len() != batch.len() {
            return Err(IndexError::Embedding(anyhow::anyhow!(
                "Embedder returned {} vectors for {} paths",
                embeddings.len(),
                batch.len()
            )));
        }

        let dimension = self.embedder.dimension();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }

        Ok(embeddings)
    }

    fn progress_bar(&self, len: usize, label: &str) -> ProgressBar {
        if !self.show_progress || len == 0 {
            return ProgressBar::hidden();
        }

        let style = ProgressStyle::with_template("{spinner} {msg} [{bar:30}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        let bar = ProgressBar::new(len as u64).with_style(style);
        bar.set_message(label.to_string());
        bar
    }
}

/// Handle that serialises build, update and search on one [`PathIndex`].
#[derive(Debug, Clone)]
pub struct SharedIndex {
    inner: Arc<Mutex<PathIndex>>,
}

impl SharedIndex {
    #[inline]
    pub fn new(index: PathIndex) -> Self {
        Self {
            inner: Arc::new(Mutex::new(index)),
        }
    }

    #[inline]
    pub fn lock(&self) -> Result<MutexGuard<'_, PathIndex>, IndexError> {
        self.inner.lock().map_err(|_| IndexError::LockPoisoned)
    }

    #[inline]
    pub fn build(&self, paths: &[String]) -> Result<BuildReport, IndexError> {
        let mut index = self.lock()?;
        index.build(paths)
    }

    #[inline]
    pub fn load(&self) -> Result<bool, IndexError> {
        let mut index = self.lock()?;
        Ok(index.load())
    }

    #[inline]
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievalHit>, IndexError> {
        let mut index = self.lock()?;
        index.search(query, k)
    }

    #[inline]
    pub fn update(&self, new_paths: &[String]) -> Result<UpdateReport, IndexError> {
        let mut index = self.lock()?;
        index.update(new_paths)
    }
}
