//! Capability-scoped execution of action descriptors.
//!
//! Before anything touches the disk every step is checked: the capabilities it
//! needs must be declared by the descriptor and every path must resolve inside
//! the sandbox roots. Each primitive re-checks both when it runs.
//!
//! Execution stops at the first failing step. Steps that already ran are not
//! rolled back.

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::action::{ActionDescriptor, Capability, Operation};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(
        "Step {step} ({operation}) needs the '{capability}' capability, which the action does not declare"
    )]
    CapabilityViolation {
        step: usize,
        operation: &'static str,
        capability: Capability,
    },

    #[error("Step {step} ({operation}) targets {} outside the allowed directories", .path.display())]
    OutsideSandbox {
        step: usize,
        operation: &'static str,
        path: PathBuf,
    },

    #[error("Step {step} ({operation}) failed on {}: {source}", .path.display())]
    RuntimeFailure {
        step: usize,
        operation: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

impl ExecutionError {
    /// 1-based index of the failing step.
    #[inline]
    pub fn step(&self) -> usize {
        match self {
            Self::CapabilityViolation { step, .. }
            | Self::OutsideSandbox { step, .. }
            | Self::RuntimeFailure { step, .. } => *step,
        }
    }

    /// Whether the filesystem may have changed before the failure.
    ///
    /// Violations are caught before the step touches the disk, but a runtime
    /// failure can leave the failing step itself half done (a directory
    /// copy that stopped midway, parents created for a file that could not
    /// be opened).
    #[inline]
    pub fn partially_applied(&self) -> bool {
        matches!(self, Self::RuntimeFailure { .. })
    }
}

/// Directories the executor may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    roots: Vec<PathBuf>,
}

impl Sandbox {
    /// Roots are resolved like targets, so a symlinked root is compared by
    /// its real location. Relative roots are dropped.
    #[inline]
    pub fn new(roots: &[PathBuf]) -> Self {
        let roots = roots
            .iter()
            .filter_map(|root| {
                let resolved = locate(root).map(|located| follow(&located).unwrap_or(located));
                if resolved.is_none() {
                    warn!("Ignoring relative sandbox root {}", root.display());
                }
                resolved
            })
            .collect();
        Self { roots }
    }

    #[inline]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// The location `path` names, with every directory symlink along the way
    /// resolved, if it lies inside a root (or is one).
    ///
    /// A final symlink is kept as named, but its target must lie inside a
    /// root too. Operations must act on the returned path, not on `path`.
    #[inline]
    pub fn confine(&self, path: &Path) -> Option<PathBuf> {
        let located = locate(path)?;
        let target = follow(&located)?;
        (self.contains(&located) && self.contains(&target)).then_some(located)
    }

    /// Like [`Sandbox::confine`], but a root itself is rejected.
    #[inline]
    pub fn confine_strictly(&self, path: &Path) -> Option<PathBuf> {
        self.confine(path)
            .filter(|located| !self.roots.iter().any(|root| root == located))
    }

    fn contains(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }
}

/// Walk `path` the way the kernel does: a symlink met before the last
/// component is replaced by its canonical target before any later `..` is
/// applied. The last component is not followed. Relative paths give `None`,
/// and so does a dangling symlink in the middle of the path.
fn locate(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }

    let mut located = PathBuf::new();
    let mut components = path.components().peekable();
    while let Some(component) = components.next() {
        match component {
            Component::Prefix(_) | Component::RootDir => located.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                located.pop();
            }
            Component::Normal(name) => {
                located.push(name);
                if components.peek().is_some() && is_symlink(&located) {
                    located = located.canonicalize().ok()?;
                }
            }
        }
    }
    Some(located)
}

/// Where a located path really points: itself unless it is a symlink.
/// A dangling symlink has no answer.
fn follow(located: &Path) -> Option<PathBuf> {
    if is_symlink(located) {
        located.canonicalize().ok()
    } else {
        Some(located.to_path_buf())
    }
}

fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .is_ok_and(|metadata| metadata.file_type().is_symlink())
}

/// Filesystem primitives bound to one step's granted capabilities.
struct ScopedFs<'a> {
    granted: &'a BTreeSet<Capability>,
    sandbox: &'a Sandbox,
    step: usize,
    operation: &'static str,
}

impl ScopedFs<'_> {
    fn require(&self, capability: Capability) -> Result<(), ExecutionError> {
        if self.granted.contains(&capability) {
            Ok(())
        } else {
            Err(ExecutionError::CapabilityViolation {
                step: self.step,
                operation: self.operation,
                capability,
            })
        }
    }

    /// The confined location of `path`. Primitives act on this, never on
    /// the path as written.
    fn confine(&self, path: &Path) -> Result<PathBuf, ExecutionError> {
        self.sandbox
            .confine(path)
            .ok_or_else(|| self.outside(path))
    }

    fn confine_strictly(&self, path: &Path) -> Result<PathBuf, ExecutionError> {
        self.sandbox
            .confine_strictly(path)
            .ok_or_else(|| self.outside(path))
    }

    fn outside(&self, path: &Path) -> ExecutionError {
        ExecutionError::OutsideSandbox {
            step: self.step,
            operation: self.operation,
            path: path.to_path_buf(),
        }
    }

    fn io<T>(&self, path: &Path, result: io::Result<T>) -> Result<T, ExecutionError> {
        result.map_err(|source| ExecutionError::RuntimeFailure {
            step: self.step,
            operation: self.operation,
            path: path.to_path_buf(),
            source,
        })
    }

    fn create_file(&self, path: &Path, content: &str, overwrite: bool) -> Result<(), ExecutionError> {
        self.require(Capability::Create)?;
        if overwrite {
            self.require(Capability::Write)?;
        }
        let path = self.confine(path)?;

        if let Some(parent) = path.parent() {
            self.io(parent, fs::create_dir_all(parent))?;
        }

        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let mut file = self.io(&path, options.open(&path))?;
        self.io(&path, file.write_all(content.as_bytes()))
    }

    fn create_dir(&self, path: &Path) -> Result<(), ExecutionError> {
        self.require(Capability::Create)?;
        let path = self.confine(path)?;
        self.io(&path, fs::create_dir_all(&path))
    }

    fn write_file(&self, path: &Path, content: &str, append: bool) -> Result<(), ExecutionError> {
        self.require(Capability::Write)?;
        let path = self.confine(path)?;

        let mut options = OpenOptions::new();
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }

        let mut file = self.io(&path, options.open(&path))?;
        self.io(&path, file.write_all(content.as_bytes()))
    }

    fn read_file(&self, path: &Path) -> Result<String, ExecutionError> {
        self.require(Capability::Read)?;
        let path = self.confine(path)?;
        self.io(&path, fs::read_to_string(&path))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<PathBuf, ExecutionError> {
        self.require(Capability::Move)?;
        let from = self.confine_strictly(from)?;
        let to = self.confine(to)?;

        let target = self.confine(&destination(&from, &to))?;
        if target.symlink_metadata().is_ok() {
            return Err(self.already_exists(&target));
        }

        self.io(&from, fs::rename(&from, &target))?;
        Ok(target)
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<PathBuf, ExecutionError> {
        self.require(Capability::Read)?;
        self.require(Capability::Create)?;
        let from = self.confine(from)?;
        let to = self.confine(to)?;

        let target = self.confine(&destination(&from, &to))?;
        if target.symlink_metadata().is_ok() {
            return Err(self.already_exists(&target));
        }

        let metadata = self.io(&from, fs::metadata(&from))?;
        if !metadata.is_dir() {
            self.io(&target, fs::copy(&from, &target))?;
            return Ok(target);
        }

        let source = self.io(&from, from.canonicalize())?;
        if target.starts_with(&from) || target.starts_with(&source) {
            return Err(ExecutionError::RuntimeFailure {
                step: self.step,
                operation: self.operation,
                path: target,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cannot copy a directory into itself",
                ),
            });
        }

        for entry in WalkDir::new(&source).sort_by_file_name() {
            let entry = self.io(&source, entry.map_err(io::Error::from))?;
            if entry.path_is_symlink() {
                warn!("Not copying symlink {}", entry.path().display());
                continue;
            }

            let relative = entry.path().strip_prefix(&source).unwrap_or(entry.path());
            let destination = target.join(relative);

            if entry.file_type().is_dir() {
                self.io(&destination, fs::create_dir_all(&destination))?;
            } else {
                self.io(&destination, fs::copy(entry.path(), &destination).map(|_| ()))?;
            }
        }

        Ok(target)
    }

    fn remove(&self, path: &Path, recursive: bool) -> Result<(), ExecutionError> {
        self.require(Capability::Delete)?;
        let path = self.confine_strictly(path)?;

        let metadata = self.io(&path, fs::symlink_metadata(&path))?;
        if !metadata.is_dir() {
            return self.io(&path, fs::remove_file(&path));
        }

        if recursive {
            self.io(&path, fs::remove_dir_all(&path))
        } else {
            self.io(&path, fs::remove_dir(&path))
        }
    }

    fn already_exists(&self, path: &Path) -> ExecutionError {
        ExecutionError::RuntimeFailure {
            step: self.step,
            operation: self.operation,
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "destination already exists"),
        }
    }
}

/// Paths of `operation`, flagged when the path may not be a sandbox root itself.
fn sandboxed_paths(operation: &Operation) -> Vec<(&Path, bool)> {
    match operation {
        Operation::Delete { path, .. } => vec![(path.as_path(), true)],
        Operation::Move { from, to } => vec![(from.as_path(), true), (to.as_path(), false)],
        _ => operation.paths().into_iter().map(|path| (path, false)).collect(),
    }
}

/// Moving or copying into an existing directory keeps the source name.
fn destination(from: &Path, to: &Path) -> PathBuf {
    match from.file_name() {
        Some(name) if to.is_dir() => to.join(name),
        _ => to.to_path_buf(),
    }
}

/// Runs validated descriptors inside a sandbox.
pub struct ActionExecutor {
    sandbox: Sandbox,
    output: Box<dyn Write + Send>,
}

impl std::fmt::Debug for ActionExecutor {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

impl ActionExecutor {
    /// An executor confined to `sandbox_roots` that prints file contents to stdout.
    #[inline]
    pub fn new(sandbox_roots: &[PathBuf]) -> Self {
        Self {
            sandbox: Sandbox::new(sandbox_roots),
            output: Box::new(io::stdout()),
        }
    }

    /// Send the output of `read_file` steps somewhere other than stdout.
    #[inline]
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = output;
        self
    }

    #[inline]
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Check every step without side effects.
    #[inline]
    pub fn preflight(&self, descriptor: &ActionDescriptor) -> Result<(), ExecutionError> {
        for (index, operation) in descriptor.operations.iter().enumerate() {
            let step = index + 1;

            for capability in operation.required_capabilities() {
                if !descriptor.capabilities.contains(capability) {
                    return Err(ExecutionError::CapabilityViolation {
                        step,
                        operation: operation.name(),
                        capability: *capability,
                    });
                }
            }

            for (path, strict) in sandboxed_paths(operation) {
                let confined = if strict {
                    self.sandbox.confine_strictly(path)
                } else {
                    self.sandbox.confine(path)
                };
                if confined.is_none() {
                    return Err(ExecutionError::OutsideSandbox {
                        step,
                        operation: operation.name(),
                        path: path.to_path_buf(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Run every step of `descriptor` in order.
    ///
    /// Nothing is executed unless the whole descriptor passes
    /// [`ActionExecutor::preflight`]. A failing step aborts the rest; steps
    /// that already ran stay applied.
    #[inline]
    pub fn execute(&mut self, descriptor: ActionDescriptor) -> Result<(), ExecutionError> {
        self.preflight(&descriptor)?;

        let ActionDescriptor {
            operations,
            explanation,
            capabilities,
        } = descriptor;

        info!("Executing action: {}", explanation);

        for (index, operation) in operations.iter().enumerate() {
            let scoped = ScopedFs {
                granted: &capabilities,
                sandbox: &self.sandbox,
                step: index + 1,
                operation: operation.name(),
            };

            debug!("Step {}: {}", scoped.step, operation);

            match operation {
                Operation::CreateFile {
                    path,
                    content,
                    overwrite,
                } => scoped.create_file(path, content, *overwrite)?,
                Operation::CreateDir { path } => scoped.create_dir(path)?,
                Operation::WriteFile {
                    path,
                    content,
                    append,
                } => scoped.write_file(path, content, *append)?,
                Operation::ReadFile { path } => {
                    let content = scoped.read_file(path)?;
                    let written = self.output.write_all(content.as_bytes()).and_then(|()| {
                        if content.ends_with('\n') {
                            Ok(())
                        } else {
                            self.output.write_all(b"\n")
                        }
                    });
                    scoped.io(path, written.and_then(|()| self.output.flush()))?;
                }
                Operation::Move { from, to } => {
                    let target = scoped.rename(from, to)?;
                    debug!("Moved {} to {}", from.display(), target.display());
                }
                Operation::Copy { from, to } => {
                    let target = scoped.copy(from, to)?;
                    debug!("Copied {} to {}", from.display(), target.display());
                }
                Operation::Delete { path, recursive } => scoped.remove(path, *recursive)?,
            }
        }

        info!("Action completed ({} steps)", operations.len());
        Ok(())
    }
}
