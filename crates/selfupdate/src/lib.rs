//! Self-update protocol (§4.7): the agent's own source tree is mutable at
//! runtime, gated by [`aigent_safety::is_self_update_path_allowed`] and
//! recoverable via git.
//!
//! Two locations matter: *live* code (what this process loaded) and a
//! *backup* (`<data>/code/backend/`, a git repository that survives
//! restarts and carries the update history). A self-update proposal lands
//! in the backup first; only a successful boot promotes it to live. Commits
//! and resets use `git2` directly, the same library and author identity
//! (`Aigent <aigent@localhost>`) the workspace's `gait` tool commits under.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Paths that are part of running the agent rather than the agent's
/// behavior — these are always synced from the shipped image on a hash
/// change, even if the backup has local (agent-authored) edits to them.
/// Chosen narrowly: the workspace manifest and lockfile, which must track
/// whatever the shipped image was built against.
const INFRASTRUCTURE_PATHS: &[&str] = &["Cargo.toml", "Cargo.lock"];

const IMAGE_HASH_FILE: &str = ".image_hash";
const NEEDS_REVERT_FILE: &str = ".needs_revert";
const HEALTHY_FILE: &str = ".healthy";

/// A self-update the agent (or an operator) proposes: a set of file
/// contents to write into the backup, plus a commit message. Rejected
/// wholesale if any path fails the allowlist check (rule 4, §4.6) — there
/// is no partial application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfUpdateProposal {
    pub paths: Vec<String>,
    pub new_contents: std::collections::HashMap<String, String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfUpdateOutcome {
    pub applied: bool,
    pub rejected_paths: Vec<String>,
    pub commit: Option<String>,
}

/// Snapshot of the on-disk marker files the boot protocol drives.
#[derive(Debug, Clone)]
pub struct SelfUpdateStatus {
    pub image_hash: Option<String>,
    pub needs_revert: bool,
    pub healthy: bool,
    pub backup_dir: PathBuf,
}

/// Owns the live/backup code locations and the marker files that drive the
/// boot protocol. Constructed once at startup, before the core loop spins
/// up — self-update is a process-lifecycle concern, not something the core
/// loop calls into directly (the agent's `self_update` tool action reaches
/// it through [`SelfUpdateManager::propose`]).
pub struct SelfUpdateManager {
    live_dir: PathBuf,
    backup_dir: PathBuf,
    code_state_dir: PathBuf,
    allowlist: Vec<String>,
}

impl SelfUpdateManager {
    pub fn new(live_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>, allowlist: Vec<String>) -> Self {
        let data_dir = data_dir.into();
        Self {
            live_dir: live_dir.into(),
            backup_dir: data_dir.join("code").join("backend"),
            code_state_dir: data_dir.join("code"),
            allowlist,
        }
    }

    fn image_hash_path(&self) -> PathBuf {
        self.code_state_dir.join(IMAGE_HASH_FILE)
    }

    fn revert_flag_path(&self) -> PathBuf {
        self.code_state_dir.join(NEEDS_REVERT_FILE)
    }

    fn healthy_flag_path(&self) -> PathBuf {
        self.code_state_dir.join(HEALTHY_FILE)
    }

    /// Run the full six-step boot protocol. Returns `true` if live code was
    /// reverted to an earlier backup commit during this boot (so the caller
    /// can log it loudly).
    pub async fn boot(&self) -> Result<bool> {
        fs::create_dir_all(&self.code_state_dir).context("creating code state dir")?;

        if !self.backup_dir.join(".git").exists() {
            self.seed_backup().await?;
        }

        // Step 1 + 2: shipped image vs stored hash.
        let shipped_hash = hash_tree(&self.live_dir)?;
        let stored_hash = fs::read_to_string(self.image_hash_path()).unwrap_or_default();
        if shipped_hash != stored_hash.trim() {
            self.merge_shipped_into_backup().await?;
            fs::write(self.image_hash_path(), &shipped_hash).context("writing image hash")?;
        }

        // Step 3: restore backup -> live.
        self.sync_backup_to_live()?;

        // Step 4: honor a pending revert from an unhealthy previous boot.
        let mut reverted = false;
        if self.revert_flag_path().exists() {
            tracing::warn!("previous boot never reported healthy; reverting backup to last commit");
            self.hard_reset_backup_one_commit().await?;
            self.sync_backup_to_live()?;
            let _ = fs::remove_file(self.revert_flag_path());
            reverted = true;
        }

        // Step 5: import-check live code; on failure, roll back the same way.
        if !import_check(&self.live_dir) {
            tracing::error!("live code failed import check after sync, rolling back");
            self.hard_reset_backup_one_commit().await?;
            self.sync_backup_to_live()?;
            let _ = fs::remove_file(self.revert_flag_path());
            reverted = true;
        }

        // Step 6: arm the revert flag. The caller clears it once the process
        // has stayed alive and healthy for `health_check_grace_secs`.
        fs::write(self.revert_flag_path(), "1").context("arming revert flag")?;
        let _ = fs::remove_file(self.healthy_flag_path());

        Ok(reverted)
    }

    /// Called after the process has run without crashing for the
    /// configured grace period. Clears the revert flag so the next boot
    /// treats this state as known-good.
    pub fn mark_healthy(&self) -> Result<()> {
        fs::write(self.healthy_flag_path(), "1").context("writing healthy marker")?;
        let _ = fs::remove_file(self.revert_flag_path());
        Ok(())
    }

    /// Snapshot of the three marker files, for operator introspection
    /// (`aigent self-update status`). Never mutates anything.
    pub fn status(&self) -> SelfUpdateStatus {
        SelfUpdateStatus {
            image_hash: fs::read_to_string(self.image_hash_path()).ok().map(|s| s.trim().to_string()),
            needs_revert: self.revert_flag_path().exists(),
            healthy: self.healthy_flag_path().exists(),
            backup_dir: self.backup_dir.clone(),
        }
    }

    /// Validate and apply a self-update proposal against the backup. Never
    /// touches live code directly — the next boot's restore step picks it
    /// up. Returns which (if any) proposed paths were rejected by the
    /// allowlist; an empty proposal with any rejection applies nothing.
    pub async fn propose(&self, proposal: SelfUpdateProposal) -> Result<SelfUpdateOutcome> {
        let rejected: Vec<String> = proposal
            .paths
            .iter()
            .filter(|p| !aigent_safety::is_self_update_path_allowed(p, &self.allowlist))
            .cloned()
            .collect();

        if !rejected.is_empty() {
            tracing::warn!(?rejected, "self-update proposal rejected by path allowlist");
            return Ok(SelfUpdateOutcome { applied: false, rejected_paths: rejected, commit: None });
        }

        for path in &proposal.paths {
            let content = proposal
                .new_contents
                .get(path)
                .ok_or_else(|| anyhow::anyhow!("proposal lists path {path} with no content"))?;
            let target = self.backup_dir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, content).with_context(|| format!("writing {path} to backup"))?;
        }

        let backup_dir = self.backup_dir.clone();
        let message = proposal.message.clone();
        let commit = tokio::task::spawn_blocking(move || commit_all(&backup_dir, &message)).await??;

        Ok(SelfUpdateOutcome { applied: true, rejected_paths: Vec::new(), commit: Some(commit) })
    }

    async fn seed_backup(&self) -> Result<()> {
        fs::create_dir_all(&self.backup_dir).context("creating backup dir")?;
        copy_tree(&self.live_dir, &self.backup_dir)?;
        let backup_dir = self.backup_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            git2::Repository::init(&backup_dir)?;
            commit_all(&backup_dir, "initial seed from shipped image")?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Copy every shipped file into the backup, except files the agent has
    /// modified locally (content already differs from what's on disk in the
    /// backup) — unless the path is in [`INFRASTRUCTURE_PATHS`], which is
    /// always overwritten so the backup never drifts from the workspace the
    /// shipped image was built against.
    async fn merge_shipped_into_backup(&self) -> Result<()> {
        let live_dir = self.live_dir.clone();
        let backup_dir = self.backup_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for entry in walk_files(&live_dir)? {
                let rel = entry.strip_prefix(&live_dir)?.to_path_buf();
                let backup_path = backup_dir.join(&rel);
                let rel_str = rel.to_string_lossy();
                let is_infra = INFRASTRUCTURE_PATHS.iter().any(|p| rel_str == *p);
                let backup_exists = backup_path.exists();

                if backup_exists && !is_infra {
                    continue;
                }
                if let Some(parent) = backup_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&entry, &backup_path)?;
            }
            commit_all(&backup_dir, "image update")?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    fn sync_backup_to_live(&self) -> Result<()> {
        copy_tree(&self.backup_dir, &self.live_dir)
    }

    async fn hard_reset_backup_one_commit(&self) -> Result<()> {
        let backup_dir = self.backup_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = git2::Repository::open(&backup_dir)?;
            let obj = repo.revparse_single("HEAD~1")?;
            let commit = obj.peel_to_commit()?;
            repo.reset(commit.as_object(), git2::ResetType::Hard, None)?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

fn commit_all(repo_path: &Path, message: &str) -> Result<String> {
    let repo = git2::Repository::open(repo_path)?;
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
    index.write()?;
    let tree_oid = index.write_tree()?;
    let tree = repo.find_tree(tree_oid)?;

    let sig = git2::Signature::now("Aigent", "aigent@localhost")?;
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(oid.to_string())
}

/// Smoke-check standing in for a compiler invocation (which this repo never
/// shells out to at runtime): every workspace member named in the root
/// manifest has a `Cargo.toml` and a non-empty crate root. Catches a
/// self-update that deletes or truncates a file; does not catch a syntax
/// error inside a file that's still present and non-empty.
fn import_check(live_dir: &Path) -> bool {
    let manifest = match fs::read_to_string(live_dir.join("Cargo.toml")) {
        Ok(raw) => raw,
        Err(_) => return false,
    };
    let members = match manifest.parse::<toml::Value>() {
        Ok(value) => value
            .get("workspace")
            .and_then(|w| w.get("members"))
            .and_then(|m| m.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect::<Vec<_>>())
            .unwrap_or_default(),
        Err(_) => return false,
    };

    for member in &members {
        let crate_dir = live_dir.join(member);
        if !crate_dir.join("Cargo.toml").exists() {
            return false;
        }
        let lib_rs = crate_dir.join("src").join("lib.rs");
        let main_rs = crate_dir.join("src").join("main.rs");
        let root = if lib_rs.exists() { lib_rs } else { main_rs };
        match fs::read(&root) {
            Ok(bytes) if !bytes.is_empty() => {}
            _ => return false,
        }
    }
    true
}

fn hash_tree(root: &Path) -> Result<String> {
    let mut files = walk_files(root)?;
    files.sort();
    let mut hasher = Sha256::new();
    for file in files {
        let rel = file.strip_prefix(root)?.to_string_lossy().into_owned();
        hasher.update(rel.as_bytes());
        hasher.update(fs::read(&file).with_context(|| format!("reading {}", file.display()))?);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Recursively lists every file under `root`, skipping `.git` and
/// `target` (build output never belongs in an image hash or a backup).
fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk_files_into(root, &mut out)?;
    Ok(out)
}

fn walk_files_into(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading dir {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if name == ".git" || name == "target" {
            continue;
        }
        if path.is_dir() {
            walk_files_into(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for file in walk_files(src)? {
        let rel = file.strip_prefix(src)?;
        let target = dst.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&file, &target).with_context(|| format!("copying {} to {}", file.display(), target.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn make_live_tree(root: &Path) {
        write_file(&root.join("Cargo.toml"), "[workspace]\nmembers = [\"crates/safety\"]\n");
        write_file(&root.join("crates/safety/Cargo.toml"), "[package]\nname = \"aigent-safety\"\n");
        write_file(&root.join("crates/safety/src/lib.rs"), "pub fn frozen() {}\n");
    }

    #[tokio::test]
    async fn boot_seeds_backup_and_syncs_live_on_first_run() {
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("live");
        let data = tmp.path().join("data");
        make_live_tree(&live);

        let manager = SelfUpdateManager::new(&live, &data, vec!["crates/tools".into()]);
        manager.boot().await.unwrap();

        assert!(data.join("code/backend/crates/safety/src/lib.rs").exists());
        assert!(data.join("code/.image_hash").exists());
        assert!(data.join("code/.needs_revert").exists());
    }

    #[tokio::test]
    async fn status_reflects_revert_flag_until_marked_healthy() {
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("live");
        let data = tmp.path().join("data");
        make_live_tree(&live);

        let manager = SelfUpdateManager::new(&live, &data, vec!["crates/tools".into()]);
        manager.boot().await.unwrap();

        let status = manager.status();
        assert!(status.needs_revert);
        assert!(!status.healthy);
        assert!(status.image_hash.is_some());

        manager.mark_healthy().unwrap();
        let status = manager.status();
        assert!(!status.needs_revert);
        assert!(status.healthy);
    }

    #[tokio::test]
    async fn propose_rejects_paths_outside_allowlist() {
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("live");
        let data = tmp.path().join("data");
        make_live_tree(&live);

        let manager = SelfUpdateManager::new(&live, &data, vec!["crates/tools".into()]);
        manager.boot().await.unwrap();

        let mut new_contents = HashMap::new();
        new_contents.insert("crates/safety/src/lib.rs".to_string(), "pub fn frozen() { /* tampered */ }\n".to_string());
        let proposal = SelfUpdateProposal {
            paths: vec!["crates/safety/src/lib.rs".to_string()],
            new_contents,
            message: "try to change safety rules".to_string(),
        };

        let outcome = manager.propose(proposal).await.unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.rejected_paths, vec!["crates/safety/src/lib.rs".to_string()]);

        let original = fs::read_to_string(data.join("code/backend/crates/safety/src/lib.rs")).unwrap();
        assert_eq!(original, "pub fn frozen() {}\n");
    }

    #[tokio::test]
    async fn propose_applies_and_commits_allowlisted_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("live");
        let data = tmp.path().join("data");
        make_live_tree(&live);
        write_file(&live.join("crates/tools/src/lib.rs"), "pub fn tools() {}\n");

        let manager = SelfUpdateManager::new(&live, &data, vec!["crates/tools".into()]);
        manager.boot().await.unwrap();

        let mut new_contents = HashMap::new();
        new_contents.insert("crates/tools/src/lib.rs".to_string(), "pub fn tools() { /* v2 */ }\n".to_string());
        let proposal = SelfUpdateProposal {
            paths: vec!["crates/tools/src/lib.rs".to_string()],
            new_contents,
            message: "add v2 marker to tools".to_string(),
        };

        let outcome = manager.propose(proposal).await.unwrap();
        assert!(outcome.applied);
        assert!(outcome.commit.is_some());

        let updated = fs::read_to_string(data.join("code/backend/crates/tools/src/lib.rs")).unwrap();
        assert!(updated.contains("v2"));
    }

    #[tokio::test]
    async fn boot_reverts_when_revert_flag_is_left_armed() {
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("live");
        let data = tmp.path().join("data");
        make_live_tree(&live);

        let manager = SelfUpdateManager::new(&live, &data, vec!["crates/safety".into()]);
        manager.boot().await.unwrap();
        manager.mark_healthy().unwrap();

        // Simulate a self-update committed to the backup, then a crash
        // before the next boot's health check could clear the flag.
        write_file(&data.join("code/backend/crates/safety/src/lib.rs"), "pub fn frozen() { /* broken */ }\n");
        let backup_dir = data.join("code/backend");
        tokio::task::spawn_blocking({
            let backup_dir = backup_dir.clone();
            move || commit_all(&backup_dir, "risky change")
        })
        .await
        .unwrap()
        .unwrap();
        fs::write(data.join("code/.needs_revert"), "1").unwrap();

        manager.boot().await.unwrap();

        let restored = fs::read_to_string(live.join("crates/safety/src/lib.rs")).unwrap();
        assert_eq!(restored, "pub fn frozen() {}\n");
        assert!(!data.join("code/.needs_revert").exists() || fs::read_to_string(data.join("code/.needs_revert")).unwrap() == "1");
    }

    #[test]
    fn import_check_fails_when_a_member_crate_root_is_missing() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(&tmp.path().join("Cargo.toml"), "[workspace]\nmembers = [\"crates/ghost\"]\n");
        assert!(!import_check(tmp.path()));
    }

    #[test]
    fn hash_tree_changes_when_file_content_changes() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(&tmp.path().join("a.rs"), "fn a() {}\n");
        let first = hash_tree(tmp.path()).unwrap();
        write_file(&tmp.path().join("a.rs"), "fn a() { /* changed */ }\n");
        let second = hash_tree(tmp.path()).unwrap();
        assert_ne!(first, second);
    }
}
