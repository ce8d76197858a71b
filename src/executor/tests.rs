use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use super::{ActionExecutor, ExecutionError, Sandbox};
use crate::PilotError;
use crate::action::{ActionDescriptor, Capability, Operation};

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        let bytes = self.0.lock().expect("buffer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .expect("buffer lock should not be poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn descriptor(operations: Vec<Operation>, capabilities: &[Capability]) -> ActionDescriptor {
    ActionDescriptor {
        operations,
        explanation: "test action".to_string(),
        capabilities: capabilities.iter().copied().collect::<BTreeSet<_>>(),
    }
}

fn executor(root: &Path) -> (ActionExecutor, SharedBuffer) {
    let buffer = SharedBuffer::default();
    let executor =
        ActionExecutor::new(&[root.to_path_buf()]).with_output(Box::new(buffer.clone()));
    (executor, buffer)
}

#[test]
fn create_file_makes_parent_directories() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let (mut executor, _) = executor(temp_dir.path());
    let target = temp_dir.path().join("Documents/notes.txt");

    executor
        .execute(descriptor(
            vec![Operation::CreateFile {
                path: target.clone(),
                content: "hello".to_string(),
                overwrite: false,
            }],
            &[Capability::Create],
        ))
        .expect("create should succeed");

    assert_eq!(fs::read_to_string(target).expect("should read file"), "hello");
}

#[test]
fn create_file_refuses_existing_file_without_overwrite() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let target = temp_dir.path().join("notes.txt");
    fs::write(&target, "original").expect("should write fixture");
    let (mut executor, _) = executor(temp_dir.path());

    let error = executor
        .execute(descriptor(
            vec![Operation::CreateFile {
                path: target.clone(),
                content: "new".to_string(),
                overwrite: false,
            }],
            &[Capability::Create],
        ))
        .expect_err("existing file should not be replaced");

    match error {
        ExecutionError::RuntimeFailure { step, source, .. } => {
            assert_eq!(step, 1);
            assert_eq!(source.kind(), io::ErrorKind::AlreadyExists);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        fs::read_to_string(target).expect("should read file"),
        "original"
    );
}

#[test]
fn overwrite_requires_write_capability() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let (mut executor, _) = executor(temp_dir.path());

    let error = executor
        .execute(descriptor(
            vec![Operation::CreateFile {
                path: temp_dir.path().join("a.txt"),
                content: String::new(),
                overwrite: true,
            }],
            &[Capability::Create],
        ))
        .expect_err("overwrite without write should be rejected");

    assert!(matches!(
        error,
        ExecutionError::CapabilityViolation {
            capability: Capability::Write,
            ..
        }
    ));
    assert!(!temp_dir.path().join("a.txt").exists());
}

#[test]
fn undeclared_delete_deletes_nothing() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let victim = temp_dir.path().join("keep.txt");
    fs::write(&victim, "keep me").expect("should write fixture");
    let (mut executor, _) = executor(temp_dir.path());

    let error = executor
        .execute(descriptor(
            vec![
                Operation::CreateDir {
                    path: temp_dir.path().join("new-dir"),
                },
                Operation::Delete {
                    path: victim.clone(),
                    recursive: false,
                },
            ],
            &[Capability::Create],
        ))
        .expect_err("delete without capability should fail");

    match error {
        ExecutionError::CapabilityViolation {
            step,
            operation,
            capability,
        } => {
            assert_eq!(step, 2);
            assert_eq!(operation, "delete");
            assert_eq!(capability, Capability::Delete);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(victim.exists());
    assert!(
        !temp_dir.path().join("new-dir").exists(),
        "no step may run when pre-flight fails"
    );
}

#[test]
fn paths_outside_roots_are_rejected() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let root = temp_dir.path().join("sandbox");
    fs::create_dir(&root).expect("should create sandbox");
    let (mut executor, _) = executor(&root);

    let escapes = [
        temp_dir.path().join("outside.txt"),
        root.join("../outside.txt"),
        PathBuf::from("relative.txt"),
    ];

    for path in escapes {
        let error = executor
            .execute(descriptor(
                vec![Operation::CreateFile {
                    path: path.clone(),
                    content: String::new(),
                    overwrite: false,
                }],
                &[Capability::Create],
            ))
            .expect_err("escape should be rejected");
        assert!(
            matches!(error, ExecutionError::OutsideSandbox { step: 1, .. }),
            "{} should be outside the sandbox",
            path.display()
        );
    }
    assert!(!temp_dir.path().join("outside.txt").exists());
}

#[cfg(unix)]
#[test]
fn symlink_escapes_are_rejected() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let root = temp_dir.path().join("sandbox");
    let outside = temp_dir.path().join("outside");
    fs::create_dir(&root).expect("should create sandbox");
    fs::create_dir(&outside).expect("should create outside dir");
    std::os::unix::fs::symlink(&outside, root.join("link")).expect("should create symlink");
    let (mut executor, _) = executor(&root);

    let error = executor
        .execute(descriptor(
            vec![Operation::CreateFile {
                path: root.join("link/escaped.txt"),
                content: String::new(),
                overwrite: false,
            }],
            &[Capability::Create],
        ))
        .expect_err("symlink escape should be rejected");

    assert!(matches!(error, ExecutionError::OutsideSandbox { .. }));
    assert!(!outside.join("escaped.txt").exists());
}

#[cfg(unix)]
#[test]
fn parent_after_symlink_resolves_from_the_link_target() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let root = temp_dir.path().join("sandbox");
    let outside = temp_dir.path().join("outside");
    fs::create_dir(&root).expect("should create sandbox");
    fs::create_dir_all(outside.join("inner")).expect("should create outside dir");
    std::os::unix::fs::symlink(outside.join("inner"), root.join("link"))
        .expect("should create symlink");
    let (mut executor, _) = executor(&root);

    let error = executor
        .execute(descriptor(
            vec![Operation::CreateFile {
                path: root.join("link/../escaped.txt"),
                content: String::new(),
                overwrite: false,
            }],
            &[Capability::Create],
        ))
        .expect_err("link followed by .. should be rejected");

    assert!(matches!(error, ExecutionError::OutsideSandbox { step: 1, .. }));
    assert!(!outside.join("escaped.txt").exists());
    assert!(!root.join("escaped.txt").exists());
}

#[cfg(unix)]
#[test]
fn parent_after_inner_symlink_stays_inside() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let root = temp_dir.path().join("sandbox");
    fs::create_dir_all(root.join("projects/current")).expect("should create fixture dirs");
    std::os::unix::fs::symlink(root.join("projects/current"), root.join("link"))
        .expect("should create symlink");
    let (mut executor, _) = executor(&root);

    executor
        .execute(descriptor(
            vec![Operation::CreateFile {
                path: root.join("link/../notes.txt"),
                content: "kept".to_string(),
                overwrite: false,
            }],
            &[Capability::Create],
        ))
        .expect("path inside the sandbox should be created");

    assert_eq!(
        fs::read_to_string(root.join("projects/notes.txt")).expect("should read file"),
        "kept"
    );
    assert!(!root.join("notes.txt").exists());
}

#[test]
fn sandbox_root_cannot_be_deleted() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let root = temp_dir.path().join("sandbox");
    fs::create_dir(&root).expect("should create sandbox");
    let (mut executor, _) = executor(&root);

    let error = executor
        .execute(descriptor(
            vec![Operation::Delete {
                path: root.clone(),
                recursive: true,
            }],
            &[Capability::Delete],
        ))
        .expect_err("deleting the root should be rejected");

    assert!(matches!(error, ExecutionError::OutsideSandbox { .. }));
    assert!(root.exists());
}

#[test]
fn write_file_truncates_or_appends() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let target = temp_dir.path().join("log.txt");
    fs::write(&target, "first\n").expect("should write fixture");
    let (mut executor, _) = executor(temp_dir.path());

    executor
        .execute(descriptor(
            vec![Operation::WriteFile {
                path: target.clone(),
                content: "second\n".to_string(),
                append: true,
            }],
            &[Capability::Write],
        ))
        .expect("append should succeed");
    assert_eq!(
        fs::read_to_string(&target).expect("should read file"),
        "first\nsecond\n"
    );

    executor
        .execute(descriptor(
            vec![Operation::WriteFile {
                path: target.clone(),
                content: "replaced".to_string(),
                append: false,
            }],
            &[Capability::Write],
        ))
        .expect("write should succeed");
    assert_eq!(
        fs::read_to_string(&target).expect("should read file"),
        "replaced"
    );
}

#[test]
fn write_file_requires_existing_file() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let (mut executor, _) = executor(temp_dir.path());

    let error = executor
        .execute(descriptor(
            vec![Operation::WriteFile {
                path: temp_dir.path().join("missing.txt"),
                content: "x".to_string(),
                append: false,
            }],
            &[Capability::Write],
        ))
        .expect_err("missing file should fail");

    match error {
        ExecutionError::RuntimeFailure { source, .. } => {
            assert_eq!(source.kind(), io::ErrorKind::NotFound);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn read_file_writes_to_output() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let target = temp_dir.path().join("readme.txt");
    fs::write(&target, "line one").expect("should write fixture");
    let (mut executor, buffer) = executor(temp_dir.path());

    executor
        .execute(descriptor(
            vec![Operation::ReadFile { path: target }],
            &[Capability::Read],
        ))
        .expect("read should succeed");

    assert_eq!(buffer.contents(), "line one\n");
}

#[test]
fn move_into_existing_directory_keeps_name() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let source = temp_dir.path().join("report.docx");
    let archive = temp_dir.path().join("Archive");
    fs::write(&source, "data").expect("should write fixture");
    fs::create_dir(&archive).expect("should create archive");
    let (mut executor, _) = executor(temp_dir.path());

    executor
        .execute(descriptor(
            vec![Operation::Move {
                from: source.clone(),
                to: archive.clone(),
            }],
            &[Capability::Move],
        ))
        .expect("move should succeed");

    assert!(!source.exists());
    assert_eq!(
        fs::read_to_string(archive.join("report.docx")).expect("should read moved file"),
        "data"
    );
}

#[test]
fn move_refuses_existing_destination() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let source = temp_dir.path().join("a.txt");
    let target = temp_dir.path().join("b.txt");
    fs::write(&source, "a").expect("should write fixture");
    fs::write(&target, "b").expect("should write fixture");
    let (mut executor, _) = executor(temp_dir.path());

    let error = executor
        .execute(descriptor(
            vec![Operation::Move {
                from: source.clone(),
                to: target.clone(),
            }],
            &[Capability::Move],
        ))
        .expect_err("existing destination should be refused");

    assert!(matches!(error, ExecutionError::RuntimeFailure { .. }));
    assert_eq!(fs::read_to_string(target).expect("should read file"), "b");
    assert!(source.exists());
}

#[test]
fn copy_directory_recursively() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let source = temp_dir.path().join("project");
    fs::create_dir_all(source.join("src")).expect("should create fixture dirs");
    fs::write(source.join("src/main.rs"), "fn main() {}").expect("should write fixture");
    fs::write(source.join("README.md"), "# project").expect("should write fixture");
    let (mut executor, _) = executor(temp_dir.path());

    let target = temp_dir.path().join("project-copy");
    executor
        .execute(descriptor(
            vec![Operation::Copy {
                from: source.clone(),
                to: target.clone(),
            }],
            &[Capability::Read, Capability::Create],
        ))
        .expect("copy should succeed");

    assert_eq!(
        fs::read_to_string(target.join("src/main.rs")).expect("should read copy"),
        "fn main() {}"
    );
    assert!(target.join("README.md").exists());
    assert!(source.join("README.md").exists());
}

#[cfg(unix)]
#[test]
fn copy_skips_symlinks_inside_the_tree() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let root = temp_dir.path().join("sandbox");
    let source = root.join("project");
    fs::create_dir_all(&source).expect("should create fixture dirs");
    fs::write(source.join("README.md"), "# project").expect("should write fixture");
    let secret = temp_dir.path().join("secret.txt");
    fs::write(&secret, "outside").expect("should write secret");
    std::os::unix::fs::symlink(&secret, source.join("secret.txt"))
        .expect("should create symlink");
    let (mut executor, _) = executor(&root);

    let target = root.join("project-copy");
    executor
        .execute(descriptor(
            vec![Operation::Copy {
                from: source,
                to: target.clone(),
            }],
            &[Capability::Read, Capability::Create],
        ))
        .expect("copy should succeed");

    assert!(target.join("README.md").exists());
    assert!(target.join("secret.txt").symlink_metadata().is_err());
}

#[cfg(unix)]
#[test]
fn copy_failing_midway_reports_partial_effects() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let source = temp_dir.path().join("project");
    fs::create_dir(&source).expect("should create fixture dir");
    fs::write(source.join("a.txt"), "copied first").expect("should write fixture");
    let _socket = std::os::unix::net::UnixListener::bind(source.join("b.sock"))
        .expect("should bind socket");
    let (mut executor, _) = executor(temp_dir.path());

    let target = temp_dir.path().join("project-copy");
    let error = executor
        .execute(descriptor(
            vec![Operation::Copy {
                from: source,
                to: target.clone(),
            }],
            &[Capability::Read, Capability::Create],
        ))
        .expect_err("a socket cannot be copied");

    assert!(matches!(error, ExecutionError::RuntimeFailure { step: 1, .. }));
    assert!(error.partially_applied());
    assert!(target.join("a.txt").exists(), "the copy stopped midway");

    let message = PilotError::Execution(error).user_message();
    assert!(message.contains("may be partly applied"), "{message}");
    assert!(!message.contains("Nothing was changed"), "{message}");
}

#[test]
fn copy_into_itself_is_refused() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let source = temp_dir.path().join("dir");
    fs::create_dir(&source).expect("should create fixture dir");
    let (mut executor, _) = executor(temp_dir.path());

    let error = executor
        .execute(descriptor(
            vec![Operation::Copy {
                from: source.clone(),
                to: source.clone(),
            }],
            &[Capability::Read, Capability::Create],
        ))
        .expect_err("recursive self copy should be refused");

    assert!(matches!(error, ExecutionError::RuntimeFailure { .. }));
}

#[test]
fn delete_directory_needs_recursive_when_not_empty() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let dir = temp_dir.path().join("old");
    fs::create_dir(&dir).expect("should create fixture dir");
    fs::write(dir.join("file.txt"), "x").expect("should write fixture");
    let (mut executor, _) = executor(temp_dir.path());

    let delete = |recursive| {
        descriptor(
            vec![Operation::Delete {
                path: dir.clone(),
                recursive,
            }],
            &[Capability::Delete],
        )
    };

    assert!(executor.execute(delete(false)).is_err());
    assert!(dir.exists());

    executor
        .execute(delete(true))
        .expect("recursive delete should succeed");
    assert!(!dir.exists());
}

#[test]
fn failure_stops_later_steps_without_rollback() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let (mut executor, _) = executor(temp_dir.path());
    let first = temp_dir.path().join("first");
    let last = temp_dir.path().join("last");

    let error = executor
        .execute(descriptor(
            vec![
                Operation::CreateDir {
                    path: first.clone(),
                },
                Operation::ReadFile {
                    path: temp_dir.path().join("missing.txt"),
                },
                Operation::CreateDir { path: last.clone() },
            ],
            &[Capability::Create, Capability::Read],
        ))
        .expect_err("missing file should fail");

    assert_eq!(error.step(), 2);
    assert!(error.partially_applied());
    assert!(first.exists(), "earlier steps are not rolled back");
    assert!(!last.exists());
}

#[test]
fn sandbox_drops_relative_roots() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let sandbox = Sandbox::new(&[PathBuf::from("relative"), temp_dir.path().to_path_buf()]);
    assert_eq!(sandbox.roots().len(), 1);
    assert!(sandbox.confine(&temp_dir.path().join("x/y")).is_some());
    assert!(sandbox.confine_strictly(temp_dir.path()).is_none());
}
