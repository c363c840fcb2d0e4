//! Git repository client: ensures a local working copy exists, fetches and
//! fast-forwards it, and reports the current commit so the poller can
//! detect new pushes without re-parsing manifests on every tick.

use std::path::{Path, PathBuf};

use git2::{FetchOptions, Repository};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("branch {0:?} not found on remote")]
    BranchNotFound(String),

    #[error("failed to remove stale working copy: {0}")]
    Io(#[from] std::io::Error),
}

pub struct RepositoryClient {
    url: String,
    branch: String,
    local_path: PathBuf,
}

impl RepositoryClient {
    pub fn new(url: impl Into<String>, branch: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
            local_path: local_path.into(),
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Clones the repository if `local_path` doesn't already contain one.
    /// If it does, the existing checkout is reused only when its `origin`
    /// remote still points at `self.url`; a stale checkout left over from a
    /// prior or misconfigured URL is removed and re-cloned rather than
    /// silently reconciled against the wrong repository.
    pub fn ensure_clone(&self) -> Result<(), Error> {
        if self.local_path.join(".git").exists() {
            if self.origin_matches()? {
                return Ok(());
            }
            std::fs::remove_dir_all(&self.local_path)?;
        }
        if let Some(parent) = self.local_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        git2::build::RepoBuilder::new()
            .branch(&self.branch)
            .clone(&self.url, &self.local_path)?;
        Ok(())
    }

    fn origin_matches(&self) -> Result<bool, Error> {
        let repo = Repository::open(&self.local_path)?;
        let origin_url = repo
            .find_remote("origin")?
            .url()
            .map(str::to_owned)
            .unwrap_or_default();
        Ok(origin_url == self.url)
    }

    /// Fetches `origin` and fast-forwards the local branch to match it.
    /// Returns the commit SHA at HEAD after the fast-forward.
    pub fn pull(&self) -> Result<String, Error> {
        let repo = Repository::open(&self.local_path)?;
        self.fetch(&repo)?;

        let remote_ref = format!("refs/remotes/origin/{}", self.branch);
        let remote_commit = repo.find_reference(&remote_ref)?.peel_to_commit()?;

        let local_ref_name = format!("refs/heads/{}", self.branch);
        match repo.find_reference(&local_ref_name) {
            Ok(mut local_ref) => {
                local_ref.set_target(remote_commit.id(), "fast-forward to origin")?;
            }
            Err(_) => {
                repo.branch(&self.branch, &remote_commit, true)?;
            }
        }
        repo.set_head(&local_ref_name)?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;

        Ok(remote_commit.id().to_string())
    }

    /// The commit SHA currently checked out, without touching the network.
    pub fn head_commit(&self) -> Result<String, Error> {
        let repo = Repository::open(&self.local_path)?;
        let head = repo.head()?.peel_to_commit()?;
        Ok(head.id().to_string())
    }

    /// Fetches `origin` and reports whether the remote branch tip differs
    /// from the locally checked out commit, without changing the working
    /// copy.
    pub fn has_remote_changes(&self) -> Result<bool, Error> {
        let repo = Repository::open(&self.local_path)?;
        self.fetch(&repo)?;

        let remote_ref = format!("refs/remotes/origin/{}", self.branch);
        let remote_commit = repo
            .find_reference(&remote_ref)
            .map_err(|_| Error::BranchNotFound(self.branch.clone()))?
            .peel_to_commit()?;
        let local_commit = repo.head()?.peel_to_commit()?;

        Ok(remote_commit.id() != local_commit.id())
    }

    fn fetch(&self, repo: &Repository) -> Result<(), Error> {
        let mut remote = repo.find_remote("origin")?;
        let mut opts = FetchOptions::new();
        remote.fetch(&[self.branch.as_str()], Some(&mut opts), None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_bare_repo_with_commit(dir: &Path, branch: &str) -> String {
        let repo = Repository::init(dir).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "test").unwrap();
            config.set_str("user.email", "test@example.com").unwrap();
        }
        let sig = git2::Signature::now("test", "test@example.com").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        let commit_id = repo
            .commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        if branch != "master" {
            let commit = repo.find_commit(commit_id).unwrap();
            repo.branch(branch, &commit, true).unwrap();
            repo.set_head(&format!("refs/heads/{branch}")).unwrap();
        }
        commit_id.to_string()
    }

    #[test]
    fn ensure_clone_is_idempotent_on_existing_checkout() {
        let upstream = tempfile::tempdir().unwrap();
        init_bare_repo_with_commit(upstream.path(), "master");

        let local = tempfile::tempdir().unwrap();
        let client = RepositoryClient::new(
            upstream.path().to_str().unwrap(),
            "master",
            local.path().join("checkout"),
        );
        client.ensure_clone().unwrap();
        assert!(local.path().join("checkout/.git").exists());
        // second call is a no-op, not an error
        client.ensure_clone().unwrap();
    }

    #[test]
    fn ensure_clone_recreates_checkout_when_origin_url_changed() {
        let upstream = tempfile::tempdir().unwrap();
        init_bare_repo_with_commit(upstream.path(), "master");

        let other_upstream = tempfile::tempdir().unwrap();
        let other_commit = init_bare_repo_with_commit(other_upstream.path(), "master");

        let local = tempfile::tempdir().unwrap();
        let checkout = local.path().join("checkout");

        let first =
            RepositoryClient::new(upstream.path().to_str().unwrap(), "master", checkout.clone());
        first.ensure_clone().unwrap();

        let second = RepositoryClient::new(
            other_upstream.path().to_str().unwrap(),
            "master",
            checkout.clone(),
        );
        second.ensure_clone().unwrap();

        assert_eq!(second.head_commit().unwrap(), other_commit);
    }

    #[test]
    fn head_commit_matches_clone_source() {
        let upstream = tempfile::tempdir().unwrap();
        let expected = init_bare_repo_with_commit(upstream.path(), "master");

        let local = tempfile::tempdir().unwrap();
        let client = RepositoryClient::new(
            upstream.path().to_str().unwrap(),
            "master",
            local.path().join("checkout"),
        );
        client.ensure_clone().unwrap();
        assert_eq!(client.head_commit().unwrap(), expected);
    }
}
