// ABOUTME: Experience manager for disposable on-disk working copies of a project
// ABOUTME: Experiences are started, continued, then committed back or discarded exactly once

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{ExperienceError, ExperienceResult};

/// Metadata file stored inside every experience directory
pub const METADATA_FILE: &str = ".experience.json";

/// Tombstones for committed and discarded ids live here, under the base dir
const RETIRED_DIR: &str = ".retired";

const MAX_ID_LEN: usize = 128;

/// Never copied into or out of an experience
const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperienceMetadata {
    pub experience_id: String,
    pub source_path: PathBuf,
    pub created: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// An active experience and where it lives on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experience {
    pub metadata: ExperienceMetadata,
    pub path: PathBuf,
}

/// Experiences of one work directory. They are stored in a sibling
/// directory named `.<work dir name>.experiences`.
#[derive(Debug, Clone)]
pub struct ExperienceManager {
    work_dir: PathBuf,
    base_dir: PathBuf,
}

pub fn validate_experience_id(id: &str) -> ExperienceResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ExperienceError::InvalidId(id.to_string()))
    }
}

impl ExperienceManager {
    pub fn new(work_dir: impl Into<PathBuf>) -> ExperienceResult<Self> {
        let work_dir = work_dir.into();
        let (Some(parent), Some(name)) = (work_dir.parent(), work_dir.file_name()) else {
            return Err(ExperienceError::fs(
                format!("cannot place experiences next to {}", work_dir.display()),
                io::Error::new(io::ErrorKind::InvalidInput, "work dir has no parent"),
            ));
        };
        let base_dir = parent.join(format!(".{}.experiences", name.to_string_lossy()));

        Ok(Self { work_dir, base_dir })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn experience_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    fn tombstone(&self, id: &str) -> PathBuf {
        self.base_dir.join(RETIRED_DIR).join(id)
    }

    pub fn is_retired(&self, id: &str) -> bool {
        self.tombstone(id).exists()
    }

    /// Create an experience as a copy of `source_path`. Fails when the id is
    /// taken or was retired. A failed copy leaves nothing behind.
    pub fn start(
        &self,
        id: &str,
        source_path: &Path,
        agent_id: Option<&str>,
    ) -> ExperienceResult<Experience> {
        validate_experience_id(id)?;
        if self.is_retired(id) {
            return Err(ExperienceError::Retired(id.to_string()));
        }

        let dir = self.experience_dir(id);
        if dir.exists() {
            return Err(ExperienceError::Exists(id.to_string()));
        }
        if !source_path.is_dir() {
            return Err(ExperienceError::fs(
                format!("source {} is not a directory", source_path.display()),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }

        fs::create_dir_all(&self.base_dir)
            .map_err(|e| ExperienceError::fs("failed to create experiences directory", e))?;

        let now = Utc::now();
        let metadata = ExperienceMetadata {
            experience_id: id.to_string(),
            source_path: source_path.to_path_buf(),
            created: now,
            last_used: now,
            agent_id: agent_id.map(str::to_string),
        };

        let populated = copy_tree(source_path, &dir, false)
            .map_err(|e| ExperienceError::fs(format!("failed to copy {}", source_path.display()), e))
            .and_then(|files| {
                write_metadata(&dir, &metadata)?;
                Ok(files)
            });

        match populated {
            Ok(files) => {
                info!(
                    "Started experience {} ({} files from {})",
                    id,
                    files,
                    source_path.display()
                );
                Ok(Experience {
                    metadata,
                    path: dir,
                })
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove partial experience {}: {}", id, cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    /// Resume an active experience and refresh its `lastUsed`
    pub fn continue_experience(&self, id: &str) -> ExperienceResult<Experience> {
        let mut experience = self.get(id)?;
        experience.metadata.last_used = Utc::now();
        write_metadata(&experience.path, &experience.metadata)?;
        debug!("Continued experience {}", id);
        Ok(experience)
    }

    /// Copy the experience over its source, then delete it and retire the id.
    /// Files deleted inside the experience are left in place in the source.
    pub fn commit(&self, id: &str) -> ExperienceResult<ExperienceMetadata> {
        let experience = self.get(id)?;
        let source = &experience.metadata.source_path;
        if !source.is_dir() {
            return Err(ExperienceError::fs(
                format!("source {} is not a directory", source.display()),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }

        let files = copy_tree(&experience.path, source, true).map_err(|e| {
            ExperienceError::fs(
                format!("failed to merge experience into {}", source.display()),
                e,
            )
        })?;

        fs::remove_dir_all(&experience.path)
            .map_err(|e| ExperienceError::fs("failed to remove committed experience", e))?;
        self.retire(id)?;

        info!(
            "Committed experience {} ({} files into {})",
            id,
            files,
            source.display()
        );
        Ok(experience.metadata)
    }

    /// Delete the experience and retire the id. A missing directory is fine.
    pub fn discard(&self, id: &str) -> ExperienceResult<()> {
        validate_experience_id(id)?;

        match fs::remove_dir_all(self.experience_dir(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Experience {} already gone", id);
            }
            Err(e) => return Err(ExperienceError::fs("failed to remove experience", e)),
        }
        self.retire(id)?;

        info!("Discarded experience {}", id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> ExperienceResult<Experience> {
        validate_experience_id(id)?;
        let path = self.experience_dir(id);
        let metadata = read_metadata(&path)?.ok_or_else(|| ExperienceError::NotFound(id.to_string()))?;
        Ok(Experience { metadata, path })
    }

    /// Active experiences, oldest first
    pub fn list(&self) -> ExperienceResult<Vec<ExperienceMetadata>> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ExperienceError::fs("failed to list experiences", e)),
        };

        let mut experiences = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ExperienceError::fs("failed to list experiences", e))?;
            let path = entry.path();
            if !path.is_dir() || entry.file_name() == RETIRED_DIR {
                continue;
            }
            match read_metadata(&path) {
                Ok(Some(metadata)) => experiences.push(metadata),
                Ok(None) => debug!("Ignoring {} without metadata", path.display()),
                Err(e) => warn!("Ignoring unreadable experience {}: {}", path.display(), e),
            }
        }

        experiences.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(experiences)
    }

    fn retire(&self, id: &str) -> ExperienceResult<()> {
        let tombstone = self.tombstone(id);
        if let Some(parent) = tombstone.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ExperienceError::fs("failed to create tombstone directory", e))?;
        }
        fs::write(&tombstone, Utc::now().to_rfc3339())
            .map_err(|e| ExperienceError::fs("failed to record tombstone", e))
    }
}

fn read_metadata(dir: &Path) -> ExperienceResult<Option<ExperienceMetadata>> {
    let path = dir.join(METADATA_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ExperienceError::fs("failed to read experience metadata", e)),
    };
    serde_json::from_str(&contents).map(Some).map_err(|e| {
        ExperienceError::fs(
            format!("corrupt metadata in {}", path.display()),
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })
}

fn write_metadata(dir: &Path, metadata: &ExperienceMetadata) -> ExperienceResult<()> {
    let json = serde_json::to_vec_pretty(metadata).map_err(|e| {
        ExperienceError::fs(
            "failed to encode experience metadata",
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })?;
    let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
    fs::write(&tmp, json)
        .and_then(|_| fs::rename(&tmp, dir.join(METADATA_FILE)))
        .map_err(|e| ExperienceError::fs("failed to write experience metadata", e))
}

fn is_excluded(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    EXCLUDED_DIRS.contains(&&*name) || name.ends_with(".experiences")
}

/// Recursively copy `from` onto `to`, overwriting files that exist in both.
/// Returns the number of files copied.
fn copy_tree(from: &Path, to: &Path, skip_metadata: bool) -> io::Result<u64> {
    let mut files = 0;

    for entry in WalkDir::new(from)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_excluded(e))
    {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        if skip_metadata && rel == Path::new(METADATA_FILE) {
            continue;
        }

        let target = to.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            files += 1;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }

    Ok(files)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    let link = fs::read_link(from)?;
    if to.symlink_metadata().is_ok() {
        fs::remove_file(to)?;
    }
    std::os::unix::fs::symlink(link, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        work_dir: PathBuf,
        manager: ExperienceManager,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let work_dir = root.path().join("project");
        fs::create_dir_all(work_dir.join("src")).unwrap();
        fs::write(work_dir.join("README.md"), "hello\n").unwrap();
        fs::write(work_dir.join("src/main.py"), "print(1)\n").unwrap();
        fs::create_dir_all(work_dir.join(".git")).unwrap();
        fs::write(work_dir.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        fs::create_dir_all(work_dir.join("node_modules/dep")).unwrap();
        fs::write(work_dir.join("node_modules/dep/index.js"), "").unwrap();

        let manager = ExperienceManager::new(&work_dir).unwrap();
        Fixture {
            _root: root,
            work_dir,
            manager,
        }
    }

    #[test]
    fn test_base_dir_is_sibling_of_work_dir() {
        let f = fixture();
        assert_eq!(
            f.manager.base_dir(),
            f.work_dir.parent().unwrap().join(".project.experiences")
        );
    }

    #[test]
    fn test_invalid_ids_are_rejected() {
        let f = fixture();
        let too_long = "x".repeat(129);
        for id in ["", "../escape", "a/b", "with space", too_long.as_str()] {
            let err = f.manager.start(id, &f.work_dir, None).unwrap_err();
            assert_eq!(err.code(), "INVALID_EXPERIENCE_ID", "{}", id);
        }
        assert!(validate_experience_id(&"x".repeat(128)).is_ok());
        assert!(validate_experience_id("run_1-A").is_ok());
    }

    #[test]
    fn test_start_copies_without_excluded_dirs() {
        let f = fixture();
        let experience = f.manager.start("exp1", &f.work_dir, Some("agent-7")).unwrap();

        assert_eq!(
            fs::read_to_string(experience.path.join("src/main.py")).unwrap(),
            "print(1)\n"
        );
        assert!(!experience.path.join(".git").exists());
        assert!(!experience.path.join("node_modules").exists());
        assert!(experience.path.join(METADATA_FILE).is_file());

        let metadata = &experience.metadata;
        assert_eq!(metadata.experience_id, "exp1");
        assert_eq!(metadata.agent_id.as_deref(), Some("agent-7"));
        assert_eq!(metadata.created, metadata.last_used);
    }

    #[test]
    fn test_start_twice_is_exists() {
        let f = fixture();
        f.manager.start("dup", &f.work_dir, None).unwrap();
        let err = f.manager.start("dup", &f.work_dir, None).unwrap_err();
        assert_eq!(err.code(), "EXPERIENCE_EXISTS");
    }

    #[test]
    fn test_start_with_missing_source_leaves_nothing() {
        let f = fixture();
        let err = f
            .manager
            .start("nope", &f.work_dir.join("missing"), None)
            .unwrap_err();
        assert_eq!(err.code(), "FILESYSTEM_ERROR");
        assert!(!f.manager.base_dir().join("nope").exists());
    }

    #[test]
    fn test_continue_refreshes_last_used() {
        let f = fixture();
        let started = f.manager.start("c1", &f.work_dir, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let continued = f.manager.continue_experience("c1").unwrap();
        assert_eq!(continued.metadata.created, started.metadata.created);
        assert!(continued.metadata.last_used > started.metadata.last_used);

        let again = f.manager.continue_experience("c1").unwrap();
        assert_eq!(again.path, continued.path);
    }

    #[test]
    fn test_continue_unknown_is_not_found() {
        let f = fixture();
        let err = f.manager.continue_experience("ghost").unwrap_err();
        assert_eq!(err.code(), "EXPERIENCE_NOT_FOUND");
    }

    #[test]
    fn test_commit_overlays_and_retires() {
        let f = fixture();
        let experience = f.manager.start("merge", &f.work_dir, None).unwrap();

        fs::write(experience.path.join("src/main.py"), "print(2)\n").unwrap();
        fs::write(experience.path.join("NEW.md"), "new\n").unwrap();
        fs::remove_file(experience.path.join("README.md")).unwrap();

        f.manager.commit("merge").unwrap();

        assert_eq!(
            fs::read_to_string(f.work_dir.join("src/main.py")).unwrap(),
            "print(2)\n"
        );
        assert!(f.work_dir.join("NEW.md").is_file());
        // Deletions are not propagated
        assert!(f.work_dir.join("README.md").is_file());
        assert!(!f.work_dir.join(METADATA_FILE).exists());
        // Excluded dirs in the source are untouched
        assert!(f.work_dir.join(".git/HEAD").is_file());

        assert!(!experience.path.exists());
        assert!(f.manager.is_retired("merge"));
        assert_eq!(
            f.manager.continue_experience("merge").unwrap_err().code(),
            "EXPERIENCE_NOT_FOUND"
        );
        assert_eq!(
            f.manager.start("merge", &f.work_dir, None).unwrap_err().code(),
            "EXPERIENCE_RETIRED"
        );
    }

    #[test]
    fn test_commit_failure_keeps_experience() {
        let f = fixture();
        let source = f._root.path().join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.txt"), "a").unwrap();
        let experience = f.manager.start("fragile", &source, None).unwrap();

        fs::remove_dir_all(&source).unwrap();
        fs::write(&source, "now a file").unwrap();

        let err = f.manager.commit("fragile").unwrap_err();
        assert_eq!(err.code(), "FILESYSTEM_ERROR");
        assert!(experience.path.join("a.txt").is_file());
        assert!(!f.manager.is_retired("fragile"));
    }

    #[test]
    fn test_discard_leaves_source_untouched() {
        let f = fixture();
        let experience = f.manager.start("tmp", &f.work_dir, None).unwrap();
        fs::write(experience.path.join("README.md"), "changed\n").unwrap();

        f.manager.discard("tmp").unwrap();
        assert!(!experience.path.exists());
        assert_eq!(
            fs::read_to_string(f.work_dir.join("README.md")).unwrap(),
            "hello\n"
        );
        assert_eq!(
            f.manager.start("tmp", &f.work_dir, None).unwrap_err().code(),
            "EXPERIENCE_RETIRED"
        );

        // Tolerates a missing directory
        f.manager.discard("never-started").unwrap();
        assert!(f.manager.is_retired("never-started"));
    }

    #[test]
    fn test_list_and_get() {
        let f = fixture();
        assert!(f.manager.list().unwrap().is_empty());

        f.manager.start("a", &f.work_dir, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        f.manager.start("b", &f.work_dir, None).unwrap();
        f.manager.discard("a").unwrap();

        let ids: Vec<_> = f
            .manager
            .list()
            .unwrap()
            .into_iter()
            .map(|m| m.experience_id)
            .collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(f.manager.get("b").unwrap().metadata.experience_id, "b");
        assert_eq!(f.manager.get("a").unwrap_err().code(), "EXPERIENCE_NOT_FOUND");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_preserved() {
        let f = fixture();
        std::os::unix::fs::symlink("README.md", f.work_dir.join("LINK.md")).unwrap();
        let experience = f.manager.start("links", &f.work_dir, None).unwrap();
        let link = experience.path.join("LINK.md");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(link).unwrap(), PathBuf::from("README.md"));
    }
}
