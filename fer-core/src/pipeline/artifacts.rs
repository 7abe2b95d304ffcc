use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::warn;

use crate::error::DemoError;

/// Prefix of the hidden sibling a tracked file is written to before commit.
const STAGING_PREFIX: &str = ".partial-";

#[derive(Debug)]
struct Artifact {
    staged: PathBuf,
    target: PathBuf,
}

/// Output files of one input. Each file is written to a hidden sibling of
/// its final path and only renamed into place by [`ArtifactSet::commit`].
/// Dropping an uncommitted set deletes the staged files, so a failed input
/// leaves nothing behind and never touches outputs of an earlier run.
#[derive(Debug, Default)]
pub struct ArtifactSet {
    artifacts: Vec<Artifact>,
}

/// `<dir>/.partial-<name>`; the extension is kept so writers that pick a
/// format from it still work.
fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{STAGING_PREFIX}{name}"))
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the final path `target` and return the staging path to write.
    pub fn track(&mut self, target: PathBuf) -> &Path {
        let staged = staging_path(&target);
        self.artifacts.push(Artifact { staged, target });
        &self.artifacts[self.artifacts.len() - 1].staged
    }

    /// Final paths of the tracked files.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.artifacts.iter().map(|a| a.target.clone()).collect()
    }

    /// Move every staged file onto its final path.
    pub fn commit(mut self) -> Result<Vec<PathBuf>> {
        let mut committed = Vec::with_capacity(self.artifacts.len());
        while !self.artifacts.is_empty() {
            let artifact = self.artifacts.remove(0);
            if let Err(e) = std::fs::rename(&artifact.staged, &artifact.target) {
                self.artifacts.insert(0, artifact);
                let failed = &self.artifacts[0];
                return Err(DemoError::io(&failed.target, e).into());
            }
            committed.push(artifact.target);
        }
        Ok(committed)
    }
}

impl Drop for ArtifactSet {
    fn drop(&mut self) {
        for artifact in &self.artifacts {
            match std::fs::remove_file(&artifact.staged) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    path = %artifact.staged.display(),
                    "could not remove partial output: {e}"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_files_keep_their_extension() {
        let staged = staging_path(Path::new("/out/clip_fps25.0_skip0.mp4"));
        assert_eq!(staged, Path::new("/out/.partial-clip_fps25.0_skip0.mp4"));
    }

    #[test]
    fn dropped_set_removes_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let written = dir.path().join("a.png");
        let never_written = dir.path().join("b.png");
        {
            let mut set = ArtifactSet::new();
            std::fs::write(set.track(written.clone()), b"x").unwrap();
            set.track(never_written.clone());
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn committed_set_moves_files_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        let mut set = ArtifactSet::new();
        std::fs::write(set.track(path.clone()), b"x").unwrap();
        assert!(!path.exists());
        assert_eq!(set.paths(), [path.clone()]);

        let kept = set.commit().unwrap();
        assert_eq!(kept, [path.clone()]);
        assert_eq!(std::fs::read(&path).unwrap(), b"x");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn failed_rerun_keeps_earlier_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"first run").unwrap();
        {
            let mut set = ArtifactSet::new();
            std::fs::write(set.track(path.clone()), b"second run, half written").unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"first run");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn commit_of_an_unwritten_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = ArtifactSet::new();
        set.track(dir.path().join("never.png"));
        let err = set.commit().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DemoError>(),
            Some(DemoError::Io { .. })
        ));
    }
}
