use anyhow::{Context, Result};
use git2::{Delta, Diff, DiffOptions, Oid, Repository};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Longest patch text kept in a summary; reviewers get a truncated diff.
const MAX_PATCH_BYTES: usize = 64 * 1024;

/// Files and lines changed by a cycle, with a truncated patch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub files_added: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    pub lines_added: usize,
    pub lines_removed: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub patch: String,
}

impl DiffSummary {
    pub fn total_files(&self) -> usize {
        self.files_added.len() + self.files_modified.len() + self.files_deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_files() == 0
    }

    /// One-line stat, e.g. `3 files, +12 -4`.
    pub fn stat_line(&self) -> String {
        format!(
            "{} file{}, +{} -{}",
            self.total_files(),
            if self.total_files() == 1 { "" } else { "s" },
            self.lines_added,
            self.lines_removed
        )
    }
}

pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::discover(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Commit HEAD points at, `None` on an unborn branch.
    pub fn head_commit(&self) -> Option<Oid> {
        self.repo.head().ok().and_then(|h| h.target())
    }

    /// Diff of the working tree (index included) against HEAD.
    pub fn diff_head(&self) -> Result<DiffSummary> {
        // An unborn branch diffs against the empty tree.
        let head_tree = match self.repo.head().and_then(|h| h.peel_to_commit()) {
            Ok(commit) => Some(commit.tree()?),
            Err(_) => None,
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))
            .context("Failed to diff working tree against HEAD")?;
        summarize(&diff)
    }

    /// Diff of the HEAD commit against its first parent. A root commit
    /// diffs against the empty tree.
    pub fn diff_last_commit(&self) -> Result<DiffSummary> {
        let commit = self
            .repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .context("HEAD does not point at a commit")?;
        let tree = commit.tree()?;
        let parent_tree = match commit.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };

        let diff = self
            .repo
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)
            .with_context(|| format!("Failed to diff commit {}", commit.id()))?;
        summarize(&diff)
    }
}

fn summarize(diff: &Diff<'_>) -> Result<DiffSummary> {
    let mut summary = DiffSummary::default();
    for delta in diff.deltas() {
        let Some(path) = delta.new_file().path().or(delta.old_file().path()) else {
            continue;
        };
        let path = path.to_path_buf();
        match delta.status() {
            Delta::Added | Delta::Untracked => summary.files_added.push(path),
            Delta::Modified | Delta::Renamed => summary.files_modified.push(path),
            Delta::Deleted => summary.files_deleted.push(path),
            _ => {}
        }
    }

    let mut patch = Vec::new();
    diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
        match line.origin() {
            '+' => summary.lines_added += 1,
            '-' => summary.lines_removed += 1,
            _ => {}
        }
        if patch.len() < MAX_PATCH_BYTES {
            if matches!(line.origin(), '+' | '-' | ' ') {
                patch.push(line.origin() as u8);
            }
            patch.extend_from_slice(line.content());
        }
        true
    })?;
    summary.patch = String::from_utf8_lossy(&patch).to_string();

    Ok(summary)
}

/// HEAD of the repository containing `project_dir`, if there is one.
pub fn head_commit(project_dir: &Path) -> Option<Oid> {
    GitTracker::new(project_dir).ok().and_then(|t| t.head_commit())
}

/// Best-effort diff capture: any failure is logged at debug and yields `None`.
///
/// When HEAD moved past `before`, the newest commit is what changed. Otherwise
/// the uncommitted working tree is.
pub fn capture_diff(project_dir: &Path, before: Option<Oid>) -> Option<DiffSummary> {
    let summary = GitTracker::new(project_dir).and_then(|tracker| {
        match tracker.head_commit() {
            Some(head) if Some(head) != before => tracker.diff_last_commit(),
            _ => tracker.diff_head(),
        }
    });
    match summary {
        Ok(summary) => Some(summary),
        Err(e) => {
            tracing::debug!(dir = %project_dir.display(), error = %e, "diff capture skipped");
            None
        }
    }
}
