//! Structured filesystem actions produced by the synthesizer.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Permission an action must declare to use an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Create,
    Write,
    Read,
    Move,
    Delete,
}

impl Capability {
    pub const ALL: [Self; 5] = [
        Self::Create,
        Self::Write,
        Self::Read,
        Self::Move,
        Self::Delete,
    ];

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Write => "write",
            Self::Read => "read",
            Self::Move => "move",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Capability {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of primitive filesystem operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateFile {
        path: PathBuf,
        #[serde(default)]
        content: String,
        #[serde(default)]
        overwrite: bool,
    },
    CreateDir {
        path: PathBuf,
    },
    WriteFile {
        path: PathBuf,
        content: String,
        #[serde(default)]
        append: bool,
    },
    ReadFile {
        path: PathBuf,
    },
    Move {
        from: PathBuf,
        to: PathBuf,
    },
    Copy {
        from: PathBuf,
        to: PathBuf,
    },
    Delete {
        path: PathBuf,
        #[serde(default)]
        recursive: bool,
    },
}

impl Operation {
    /// Wire name, as used in the `op` field.
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateFile { .. } => "create_file",
            Self::CreateDir { .. } => "create_dir",
            Self::WriteFile { .. } => "write_file",
            Self::ReadFile { .. } => "read_file",
            Self::Move { .. } => "move",
            Self::Copy { .. } => "copy",
            Self::Delete { .. } => "delete",
        }
    }

    #[inline]
    pub fn required_capabilities(&self) -> &'static [Capability] {
        match self {
            Self::CreateFile {
                overwrite: true, ..
            } => &[Capability::Create, Capability::Write],
            Self::CreateFile { .. } | Self::CreateDir { .. } => &[Capability::Create],
            Self::WriteFile { .. } => &[Capability::Write],
            Self::ReadFile { .. } => &[Capability::Read],
            Self::Move { .. } => &[Capability::Move],
            Self::Copy { .. } => &[Capability::Read, Capability::Create],
            Self::Delete { .. } => &[Capability::Delete],
        }
    }

    /// Every path the operation touches.
    #[inline]
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::CreateFile { path, .. }
            | Self::CreateDir { path }
            | Self::WriteFile { path, .. }
            | Self::ReadFile { path }
            | Self::Delete { path, .. } => vec![path.as_path()],
            Self::Move { from, to } | Self::Copy { from, to } => vec![from.as_path(), to.as_path()],
        }
    }
}

impl fmt::Display for Operation {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateFile {
                path, overwrite, ..
            } => {
                write!(f, "create file {}", path.display())?;
                if *overwrite {
                    f.write_str(" (overwrite)")?;
                }
                Ok(())
            }
            Self::CreateDir { path } => write!(f, "create directory {}", path.display()),
            Self::WriteFile { path, append, .. } => {
                let verb = if *append { "append to" } else { "write" };
                write!(f, "{verb} {}", path.display())
            }
            Self::ReadFile { path } => write!(f, "read {}", path.display()),
            Self::Move { from, to } => write!(f, "move {} to {}", from.display(), to.display()),
            Self::Copy { from, to } => write!(f, "copy {} to {}", from.display(), to.display()),
            Self::Delete { path, recursive } => {
                write!(f, "delete {}", path.display())?;
                if *recursive {
                    f.write_str(" (recursive)")?;
                }
                Ok(())
            }
        }
    }
}

/// A validated action: what to do, why, and the permissions it claims.
///
/// Descriptors are consumed by the executor and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub operations: Vec<Operation>,
    pub explanation: String,
    pub capabilities: BTreeSet<Capability>,
}

impl ActionDescriptor {
    /// Check the structural rules a parsed descriptor must satisfy.
    #[inline]
    pub fn validate(&self) -> Result<(), String> {
        if self.operations.is_empty() {
            return Err("operations must not be empty".to_string());
        }

        if self.explanation.trim().is_empty() {
            return Err("explanation must not be empty".to_string());
        }

        for (step, operation) in self.operations.iter().enumerate() {
            if operation
                .paths()
                .iter()
                .any(|path| path.as_os_str().is_empty())
            {
                return Err(format!(
                    "operation {} ({}) has an empty path",
                    step + 1,
                    operation.name()
                ));
            }
        }

        Ok(())
    }

    /// Union of the capabilities the operations need.
    #[inline]
    pub fn required_capabilities(&self) -> BTreeSet<Capability> {
        self.operations
            .iter()
            .flat_map(|op| op.required_capabilities().iter().copied())
            .collect()
    }
}
