//! Moving a staged partition tree to its final storage.

use crate::dataset::temp_path_for;
use crate::error::{HexpartError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

/// How an upload treats files already present at the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the whole destination tree once the new one is complete.
    Overwrite,
    /// Replace files with the same relative path, leave all others alone.
    #[default]
    OverwriteOrIgnore,
}

pub trait Uploader: Send + Sync {
    /// Copy everything under `staging` to the destination.
    fn upload(&self, staging: &Path) -> Result<()>;

    /// Human-readable destination, for logs.
    fn destination(&self) -> String;
}

/// Recursive copy into a local (or mounted) directory.
#[derive(Debug, Clone)]
pub struct LocalCopy {
    pub dest: PathBuf,
    pub mode: WriteMode,
}

impl LocalCopy {
    pub fn new(dest: impl Into<PathBuf>, mode: WriteMode) -> Self {
        Self {
            dest: dest.into(),
            mode,
        }
    }
}

type CopyFn<'a> = dyn Fn(&Path, &Path) -> std::io::Result<u64> + 'a;

impl LocalCopy {
    fn upload_with(&self, staging: &Path, copy: &CopyFn<'_>) -> Result<()> {
        match self.mode {
            WriteMode::OverwriteOrIgnore => copy_tree(staging, &self.dest, copy),
            WriteMode::Overwrite => self.replace_tree(staging, copy),
        }
    }

    /// Assemble the new tree beside the destination, then swap it in. The
    /// previous output stays in place until the new one is complete.
    fn replace_tree(&self, staging: &Path, copy: &CopyFn<'_>) -> Result<()> {
        if let Some(parent) = self.dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let incoming = temp_path_for(&self.dest);
        if let Err(e) = copy_tree(staging, &incoming, copy) {
            remove_tree_quietly(&incoming);
            return Err(e);
        }

        if !self.dest.exists() {
            if let Err(e) = fs::rename(&incoming, &self.dest) {
                remove_tree_quietly(&incoming);
                return Err(e.into());
            }
            return Ok(());
        }

        let retired = temp_path_for(&self.dest);
        if let Err(e) = fs::rename(&self.dest, &retired) {
            remove_tree_quietly(&incoming);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&incoming, &self.dest) {
            fs::rename(&retired, &self.dest)?;
            remove_tree_quietly(&incoming);
            return Err(e.into());
        }
        remove_tree_quietly(&retired);
        Ok(())
    }
}

impl Uploader for LocalCopy {
    fn upload(&self, staging: &Path) -> Result<()> {
        self.upload_with(staging, &|from: &Path, to: &Path| fs::copy(from, to))
    }

    fn destination(&self) -> String {
        self.dest.display().to_string()
    }
}

/// Copy every file under `staging` into `dest`, each through a temp sibling
/// renamed into place, so no destination file is ever partially written.
fn copy_tree(staging: &Path, dest: &Path, copy: &CopyFn<'_>) -> Result<()> {
    fs::create_dir_all(dest)?;

    for entry in WalkDir::new(staging).sort_by_file_name() {
        let entry = entry.map_err(|e| HexpartError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(staging)
            .map_err(|e| HexpartError::Upload(e.to_string()))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            let partial = temp_path_for(&target);
            if let Err(e) = copy(entry.path(), &partial).and_then(|_| fs::rename(&partial, &target)) {
                let _ = fs::remove_file(&partial);
                return Err(HexpartError::Upload(format!(
                    "copying {} to {}: {e}",
                    entry.path().display(),
                    target.display()
                )));
            }
        }
    }

    Ok(())
}

fn remove_tree_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_dir_all(path) {
            tracing::warn!(path = %path.display(), error = %e, "could not remove directory");
        }
    }
}

/// Shells out to an object-store sync tool (e.g. `aws s3 sync`).
///
/// `args` may contain the placeholders `{src}` and `{dst}`.
#[derive(Debug, Clone)]
pub struct SyncCommand {
    pub program: String,
    pub args: Vec<String>,
    pub dest: String,
}

impl SyncCommand {
    /// `aws s3 sync <staging> <dest>`.
    pub fn aws_s3(dest: impl Into<String>) -> Self {
        Self {
            program: "aws".into(),
            args: vec!["s3".into(), "sync".into(), "{src}".into(), "{dst}".into()],
            dest: dest.into(),
        }
    }
}

impl Uploader for SyncCommand {
    fn upload(&self, staging: &Path) -> Result<()> {
        let src = staging.display().to_string();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{src}", &src).replace("{dst}", &self.dest))
            .collect();

        tracing::info!(program = %self.program, ?args, "syncing staged partitions");
        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .map_err(|e| HexpartError::Upload(format!("failed to run '{}': {e}", self.program)))?;

        if !status.success() {
            return Err(HexpartError::Upload(format!(
                "'{}' exited with {status}",
                self.program
            )));
        }
        Ok(())
    }

    fn destination(&self) -> String {
        self.dest.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_overwrite_or_ignore_keeps_unrelated_files() {
        let staging = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        fs::create_dir_all(staging.path().join("p=1")).unwrap();
        fs::write(staging.path().join("p=1/part-00000.parquet"), b"new").unwrap();
        fs::create_dir_all(dest.path().join("p=1")).unwrap();
        fs::write(dest.path().join("p=1/part-00000.parquet"), b"old").unwrap();
        fs::write(dest.path().join("keep.txt"), b"keep").unwrap();

        LocalCopy::new(dest.path(), WriteMode::OverwriteOrIgnore)
            .upload(staging.path())
            .unwrap();

        assert_eq!(fs::read(dest.path().join("p=1/part-00000.parquet")).unwrap(), b"new");
        assert!(dest.path().join("keep.txt").exists());
    }

    #[test]
    fn test_overwrite_clears_destination() {
        let staging = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(staging.path().join("a"), b"a").unwrap();
        fs::write(dest.path().join("stale"), b"x").unwrap();

        LocalCopy::new(dest.path(), WriteMode::Overwrite)
            .upload(staging.path())
            .unwrap();

        assert!(dest.path().join("a").exists());
        assert!(!dest.path().join("stale").exists());
    }

    fn files_under(root: &Path) -> Vec<(String, Vec<u8>)> {
        let mut files: Vec<_> = WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let relative = e.path().strip_prefix(root).unwrap().display().to_string();
                (relative, fs::read(e.path()).unwrap())
            })
            .collect();
        files.sort();
        files
    }

    /// Copies normally, except that the second file is cut short.
    fn fail_on_second_copy(calls: &AtomicUsize) -> impl Fn(&Path, &Path) -> std::io::Result<u64> + '_ {
        move |from, to| {
            if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                fs::write(to, b"trunc")?;
                return Err(std::io::Error::other("disk full"));
            }
            fs::copy(from, to)
        }
    }

    #[test]
    fn test_failed_copy_leaves_previous_output_intact() {
        let staging = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        for p in ["p=1", "p=2"] {
            fs::create_dir_all(staging.path().join(p)).unwrap();
            fs::write(staging.path().join(p).join("part-00000.parquet"), b"new").unwrap();
            fs::create_dir_all(root.path().join("out").join(p)).unwrap();
            fs::write(root.path().join("out").join(p).join("part-00000.parquet"), b"old").unwrap();
        }
        let before = files_under(root.path());

        let calls = AtomicUsize::new(0);
        let result = LocalCopy::new(root.path().join("out"), WriteMode::Overwrite)
            .upload_with(staging.path(), &fail_on_second_copy(&calls));
        assert!(matches!(result, Err(HexpartError::Upload(_))));
        assert_eq!(files_under(root.path()), before);
    }

    #[test]
    fn test_failed_copy_never_leaves_partial_files() {
        let staging = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        for p in ["p=1", "p=2"] {
            fs::create_dir_all(staging.path().join(p)).unwrap();
            fs::write(staging.path().join(p).join("part-00000.parquet"), b"new").unwrap();
            fs::create_dir_all(dest.path().join(p)).unwrap();
            fs::write(dest.path().join(p).join("part-00000.parquet"), b"old").unwrap();
        }

        let calls = AtomicUsize::new(0);
        let result = LocalCopy::new(dest.path(), WriteMode::OverwriteOrIgnore)
            .upload_with(staging.path(), &fail_on_second_copy(&calls));
        assert!(result.is_err());
        assert_eq!(
            files_under(dest.path()),
            vec![
                ("p=1/part-00000.parquet".to_string(), b"new".to_vec()),
                ("p=2/part-00000.parquet".to_string(), b"old".to_vec()),
            ]
        );
    }

    #[test]
    fn test_sync_command_failure_is_reported() {
        let staging = tempfile::tempdir().unwrap();
        let sync = SyncCommand {
            program: "hexpart-no-such-sync-tool".into(),
            args: vec!["{src}".into(), "{dst}".into()],
            dest: "s3://bucket/out".into(),
        };
        assert!(matches!(sync.upload(staging.path()), Err(HexpartError::Upload(_))));
    }
}
