//! On-disk layout of the path index.
//!
//! ```text
//! <index dir>/
//!   manifest.json              commit point, replaced atomically
//!   paths-<generation>.jsonl   one JSON string per line, in ordinal order
//!   vectors-<generation>.f32   little-endian f32 rows, `dimension` per row
//! ```
//!
//! Only the prefix of each data file named by the manifest is ever read. Bytes
//! past it belong to an interrupted write and are truncated by the next append.


use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const FORMAT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const F32_BYTES: u64 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generation: u64,
    pub model: String,
    pub dimension: usize,
    pub count: usize,
    /// Committed length of the paths file.
    pub paths_bytes: u64,
    pub updated_at: DateTime<Utc>,
}

impl Manifest {
    /// Committed length of the vectors file. Fails when the counts in the
    /// manifest cannot describe a real file.
    #[inline]
    pub fn vectors_bytes(&self) -> Result<u64> {
        (self.count as u64)
            .checked_mul(self.dimension as u64)
            .and_then(|values| values.checked_mul(F32_BYTES))
            .with_context(|| {
                format!(
                    "Manifest claims {} rows of {} dimensions, which overflows",
                    self.count, self.dimension
                )
            })
    }
}

/// Paths and raw vectors of a committed generation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub manifest: Manifest,
    pub paths: Vec<String>,
    /// Row-major, `manifest.count * manifest.dimension` values.
    pub vectors: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    #[inline]
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    fn paths_file(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("paths-{generation}.jsonl"))
    }

    fn vectors_file(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("vectors-{generation}.f32"))
    }

    /// The committed manifest, or `None` when nothing has been committed yet.
    #[inline]
    pub fn read_manifest(&self) -> Result<Option<Manifest>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))?;

        if manifest.format_version != FORMAT_VERSION {
            bail!(
                "Unsupported index format version {} (expected {})",
                manifest.format_version,
                FORMAT_VERSION
            );
        }

        Ok(Some(manifest))
    }

    /// Read the committed generation.
    ///
    /// Fails when either data file is shorter than the manifest claims or the
    /// number of stored paths differs from the committed count.
    #[inline]
    pub fn load(&self) -> Result<Option<Snapshot>> {
        let Some(manifest) = self.read_manifest()? else {
            return Ok(None);
        };

        let vectors = self.read_vectors(&manifest)?;
        let paths = self.read_paths(&manifest)?;

        debug!(
            "Loaded generation {} with {} paths from {}",
            manifest.generation,
            paths.len(),
            self.dir.display()
        );

        Ok(Some(Snapshot {
            manifest,
            paths,
            vectors,
        }))
    }

    fn read_paths(&self, manifest: &Manifest) -> Result<Vec<String>> {
        let path = self.paths_file(manifest.generation);
        let file =
            File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;

        let actual_len = file.metadata()?.len();
        if actual_len < manifest.paths_bytes {
            bail!(
                "Paths file {} holds {} bytes, manifest expects {}",
                path.display(),
                actual_len,
                manifest.paths_bytes
            );
        }

        let reader = BufReader::new(file.take(manifest.paths_bytes));
        // Every line takes at least three bytes (`""` and a newline).
        let hint = usize::try_from(manifest.paths_bytes / 3).unwrap_or(usize::MAX);
        let mut paths = Vec::with_capacity(manifest.count.min(hint));
        for line in reader.lines() {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            let entry: String = serde_json::from_str(&line)
                .with_context(|| format!("Corrupt entry in {}", path.display()))?;
            paths.push(entry);
        }

        if paths.len() != manifest.count {
            bail!(
                "Paths file {} holds {} entries, manifest expects {}",
                path.display(),
                paths.len(),
                manifest.count
            );
        }

        Ok(paths)
    }

    fn read_vectors(&self, manifest: &Manifest) -> Result<Vec<f32>> {
        let path = self.vectors_file(manifest.generation);
        let file =
            File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;

        let expected = manifest.vectors_bytes()?;
        let actual_len = file.metadata()?.len();
        if actual_len < expected {
            bail!(
                "Vectors file {} holds {} bytes, manifest expects {}",
                path.display(),
                actual_len,
                expected
            );
        }

        let mut bytes = Vec::with_capacity(usize::try_from(expected)?);
        BufReader::new(file.take(expected))
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Ok(bytes
            .chunks_exact(F32_BYTES as usize)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    /// Start a fresh generation after the committed one (or the first).
    ///
    /// Nothing becomes visible to [`IndexStore::load`] until the writer is
    /// committed.
    #[inline]
    pub fn begin_generation(&self, model: &str, dimension: usize) -> Result<GenerationWriter> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create index directory {}", self.dir.display()))?;

        let previous = match self.read_manifest() {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Ignoring unreadable manifest while starting a build: {e:#}");
                None
            }
        };
        let generation = previous.as_ref().map_or(1, |m| m.generation + 1);

        let paths = File::create(self.paths_file(generation))
            .context("Failed to create paths file")?;
        let vectors = File::create(self.vectors_file(generation))
            .context("Failed to create vectors file")?;

        debug!("Started index generation {}", generation);

        Ok(GenerationWriter {
            store: self.clone(),
            manifest: Manifest {
                format_version: FORMAT_VERSION,
                generation,
                model: model.to_string(),
                dimension,
                count: 0,
                paths_bytes: 0,
                updated_at: Utc::now(),
            },
            paths: BufWriter::new(paths),
            vectors: BufWriter::new(vectors),
            fresh: true,
        })
    }

    /// Reopen the committed generation for appending.
    ///
    /// Both files are first cut back to the committed lengths.
    #[inline]
    pub fn append_to(&self, manifest: &Manifest) -> Result<GenerationWriter> {
        let paths = open_truncated(&self.paths_file(manifest.generation), manifest.paths_bytes)?;
        let vectors = open_truncated(
            &self.vectors_file(manifest.generation),
            manifest.vectors_bytes()?,
        )?;

        Ok(GenerationWriter {
            store: self.clone(),
            manifest: manifest.clone(),
            paths: BufWriter::new(paths),
            vectors: BufWriter::new(vectors),
            fresh: false,
        })
    }

    /// Write `manifest` to a temporary file, fsync it and rename it over the
    /// committed one.
    fn commit_manifest(&self, manifest: &Manifest) -> Result<()> {
        let tmp = self.dir.join(format!("{MANIFEST_FILE}.tmp"));
        let content =
            serde_json::to_vec_pretty(manifest).context("Failed to serialize manifest")?;

        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(&content)?;
            file.sync_all()?;
        }

        fs::rename(&tmp, self.manifest_path()).context("Failed to replace manifest")?;
        Ok(())
    }

    /// Delete data files of every generation except `keep`.
    fn remove_stale_generations(&self, keep: u64) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            let generation = name
                .strip_prefix("paths-")
                .and_then(|rest| rest.strip_suffix(".jsonl"))
                .or_else(|| {
                    name.strip_prefix("vectors-")
                        .and_then(|rest| rest.strip_suffix(".f32"))
                })
                .and_then(|number| number.parse::<u64>().ok());

            if generation.is_none_or(|generation| generation == keep) {
                continue;
            }

            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("Failed to remove stale index file {}: {}", name, e);
            } else {
                debug!("Removed stale index file {}", name);
            }
        }
    }
}

fn open_truncated(path: &Path, len: u64) -> Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let actual = file.metadata()?.len();
    if actual < len {
        bail!(
            "{} holds {} bytes, manifest expects {}",
            path.display(),
            actual,
            len
        );
    }
    if actual > len {
        warn!(
            "Discarding {} uncommitted bytes from {}",
            actual - len,
            path.display()
        );
        file.set_len(len)?;
    }

    file.seek(SeekFrom::Start(len))?;
    Ok(file)
}

/// Appends rows to one generation and commits them through the manifest.
#[derive(Debug)]
pub struct GenerationWriter {
    store: IndexStore,
    manifest: Manifest,
    paths: BufWriter<File>,
    vectors: BufWriter<File>,
    fresh: bool,
}

impl GenerationWriter {
    /// Number of rows including the ones not committed yet.
    #[inline]
    pub fn count(&self) -> usize {
        self.manifest.count
    }

    /// Append a batch of rows. `vectors` must match `paths` one to one.
    #[inline]
    pub fn append(&mut self, paths: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        if paths.len() != vectors.len() {
            bail!(
                "Batch has {} paths but {} vectors",
                paths.len(),
                vectors.len()
            );
        }

        for (path, vector) in paths.iter().zip(vectors) {
            if vector.len() != self.manifest.dimension {
                bail!(
                    "Vector for {} has {} dimensions, index expects {}",
                    path,
                    vector.len(),
                    self.manifest.dimension
                );
            }

            let mut line = serde_json::to_string(path).context("Failed to encode path")?;
            line.push('\n');
            self.paths.write_all(line.as_bytes())?;
            self.manifest.paths_bytes += line.len() as u64;

            for value in vector {
                self.vectors.write_all(&value.to_le_bytes())?;
            }
            self.manifest.count += 1;
        }

        Ok(())
    }

    /// Flush and fsync the data files, then publish the new manifest.
    ///
    /// For a fresh generation the files of older generations are removed
    /// afterwards.
    #[inline]
    pub fn commit(self) -> Result<Manifest> {
        let Self {
            store,
            mut manifest,
            paths,
            vectors,
            fresh,
        } = self;

        let paths = paths.into_inner().context("Failed to flush paths file")?;
        paths.sync_all().context("Failed to sync paths file")?;
        let vectors = vectors
            .into_inner()
            .context("Failed to flush vectors file")?;
        vectors.sync_all().context("Failed to sync vectors file")?;

        manifest.updated_at = Utc::now();
        store.commit_manifest(&manifest)?;

        if fresh {
            store.remove_stale_generations(manifest.generation);
        }

        info!(
            "Committed index generation {} with {} paths",
            manifest.generation, manifest.count
        );
        Ok(manifest)
    }
}
