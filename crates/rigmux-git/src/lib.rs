use anyhow::{Result, bail};
use git2::build::CheckoutBuilder;
use git2::{BranchType, Repository, StatusOptions};
use rigmux_protocol::Advisory;
use std::path::Path;
use tracing::{info, warn};

const REMOTE: &str = "origin";

fn current_branch(repo: &Repository) -> Option<String> {
    repo.head()
        .ok()
        .filter(|head| head.is_branch())
        .and_then(|head| head.shorthand().map(ToOwned::to_owned))
}

fn detect_dirty(repo: &Repository) -> Result<bool> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(false)
        .include_ignored(false)
        .renames_head_to_index(true);

    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(!statuses.is_empty())
}

/// Outcome of the default-branch guard run before a worker session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchGuard {
    NotARepo,
    OnDefault {
        branch: String,
    },
    Switched {
        from: Option<String>,
        to: String,
        pull: Advisory,
    },
    SwitchFailed {
        from: Option<String>,
        to: String,
        checkout: Advisory,
    },
    Unreadable(Advisory),
}

impl BranchGuard {
    /// Route every failure to the log; returns the warning lines.
    pub fn log(self) -> Vec<String> {
        match self {
            BranchGuard::NotARepo | BranchGuard::OnDefault { .. } => Vec::new(),
            BranchGuard::Switched { pull, .. } => pull.log().into_iter().collect(),
            BranchGuard::SwitchFailed { checkout, .. } => checkout.log().into_iter().collect(),
            BranchGuard::Unreadable(adv) => adv.log().into_iter().collect(),
        }
    }
}

fn is_default(branch: &str, default: &str) -> bool {
    branch == default || (default == "main" && branch == "master")
}

/// Put `work_dir` back on `default` and fast-forward it from `origin`.
///
/// Never fails: checkout and pull problems come back as advisories.
pub fn ensure_default_branch(work_dir: &Path, default: &str) -> BranchGuard {
    let repo = match Repository::discover(work_dir) {
        Ok(repo) => repo,
        Err(_) => return BranchGuard::NotARepo,
    };
    let from = current_branch(&repo);
    if let Some(branch) = from.as_deref().filter(|b| is_default(b, default)) {
        return BranchGuard::OnDefault {
            branch: branch.to_string(),
        };
    }

    match detect_dirty(&repo) {
        Ok(false) => {}
        Ok(true) => {
            return BranchGuard::SwitchFailed {
                from,
                to: default.to_string(),
                checkout: Advisory::failed(
                    format!("checkout {default}"),
                    "work tree has uncommitted changes",
                ),
            };
        }
        Err(err) => return BranchGuard::Unreadable(Advisory::failed("read work tree status", err)),
    }

    warn!(
        work_dir = %work_dir.display(),
        branch = from.as_deref().unwrap_or("(detached)"),
        default,
        "not on default branch, switching"
    );
    if let Err(err) = checkout_branch(&repo, default) {
        return BranchGuard::SwitchFailed {
            from,
            to: default.to_string(),
            checkout: Advisory::failed(format!("checkout {default}"), err),
        };
    }
    let pull = Advisory::from_result(
        format!("pull {REMOTE}/{default}"),
        fast_forward(&repo, default),
    );
    info!(work_dir = %work_dir.display(), default, "switched to default branch");
    BranchGuard::Switched {
        from,
        to: default.to_string(),
        pull,
    }
}

fn checkout_branch(repo: &Repository, branch: &str) -> Result<()> {
    if repo.find_branch(branch, BranchType::Local).is_err() {
        let remote_name = format!("{REMOTE}/{branch}");
        let remote = repo.find_branch(&remote_name, BranchType::Remote)?;
        let commit = remote.get().peel_to_commit()?;
        let mut local = repo.branch(branch, &commit, false)?;
        local.set_upstream(Some(&remote_name))?;
    }
    let refname = format!("refs/heads/{branch}");
    let target = repo.revparse_single(&refname)?;
    repo.checkout_tree(&target, Some(CheckoutBuilder::new().safe()))?;
    repo.set_head(&refname)?;
    Ok(())
}

fn fast_forward(repo: &Repository, branch: &str) -> Result<()> {
    let mut remote = repo.find_remote(REMOTE)?;
    remote.fetch(&[branch], None, None)?;

    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let incoming = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&incoming])?;
    if analysis.is_up_to_date() {
        return Ok(());
    }
    if !analysis.is_fast_forward() {
        bail!("{branch} has diverged from {REMOTE}; not fast-forwarding");
    }

    let refname = format!("refs/heads/{branch}");
    let mut reference = repo.find_reference(&refname)?;
    reference.set_target(incoming.id(), "rigmux: fast-forward")?;
    repo.set_head(&refname)?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{RepositoryInitOptions, Signature};
    use tempfile::tempdir;

    fn init_main(path: &Path) -> Repository {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        Repository::init_opts(path, &opts).expect("init repo")
    }

    fn commit_file(repo: &Repository, name: &str, body: &str) {
        let root = repo.workdir().expect("workdir").to_path_buf();
        std::fs::write(root.join(name), body).expect("write file");
        let mut index = repo.index().expect("index");
        index.add_path(Path::new(name)).expect("add path");
        index.write().expect("write index");
        let tree_id = index.write_tree().expect("write tree");
        let tree = repo.find_tree(tree_id).expect("find tree");
        let sig = Signature::now("rigmux", "rigmux@example.com").expect("sig");
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, name, &tree, &parent_refs)
            .expect("commit");
    }

    #[test]
    fn outside_repo_is_not_a_repo() {
        let dir = tempdir().expect("tempdir");
        assert_eq!(ensure_default_branch(dir.path(), "main"), BranchGuard::NotARepo);
    }

    #[test]
    fn already_on_default() {
        let dir = tempdir().expect("tempdir");
        let repo = init_main(dir.path());
        commit_file(&repo, "README.md", "hello");
        assert_eq!(
            ensure_default_branch(dir.path(), "main"),
            BranchGuard::OnDefault {
                branch: "main".into()
            }
        );
    }

    #[test]
    fn switches_back_and_fast_forwards() {
        let origin_dir = tempdir().expect("tempdir");
        let origin = init_main(origin_dir.path());
        commit_file(&origin, "README.md", "v1");

        let clone_dir = tempdir().expect("tempdir");
        let clone = Repository::clone(origin_dir.path().to_str().expect("utf8"), clone_dir.path())
            .expect("clone");
        let head = clone.head().expect("head").peel_to_commit().expect("commit");
        clone.branch("feature", &head, false).expect("branch");
        clone.set_head("refs/heads/feature").expect("set head");

        commit_file(&origin, "NEWS.md", "v2");

        match ensure_default_branch(clone_dir.path(), "main") {
            BranchGuard::Switched { from, to, pull } => {
                assert_eq!(from.as_deref(), Some("feature"));
                assert_eq!(to, "main");
                assert!(pull.is_ok(), "{:?}", pull.failure());
            }
            other => panic!("unexpected {other:?}"),
        }
        let clone = Repository::open(clone_dir.path()).expect("reopen");
        assert_eq!(current_branch(&clone).as_deref(), Some("main"));
        assert!(clone_dir.path().join("NEWS.md").exists());
    }

    #[test]
    fn missing_default_is_warning_not_error() {
        let dir = tempdir().expect("tempdir");
        let repo = init_main(dir.path());
        commit_file(&repo, "README.md", "hello");
        match ensure_default_branch(dir.path(), "trunk") {
            BranchGuard::SwitchFailed { checkout, .. } => {
                assert!(!checkout.is_ok());
                assert_eq!(
                    BranchGuard::SwitchFailed {
                        from: None,
                        to: "trunk".into(),
                        checkout,
                    }
                    .log()
                    .len(),
                    1
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dirty_tree_is_left_alone() {
        let dir = tempdir().expect("tempdir");
        let repo = init_main(dir.path());
        commit_file(&repo, "README.md", "hello");
        let head = repo.head().expect("head").peel_to_commit().expect("commit");
        repo.branch("feature", &head, false).expect("branch");
        repo.set_head("refs/heads/feature").expect("set head");
        std::fs::write(dir.path().join("README.md"), "edited").expect("edit");

        match ensure_default_branch(dir.path(), "main") {
            BranchGuard::SwitchFailed { from, checkout, .. } => {
                assert_eq!(from.as_deref(), Some("feature"));
                assert!(checkout.failure().is_some_and(|f| f.contains("uncommitted")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(current_branch(&repo).as_deref(), Some("feature"));
    }
}
