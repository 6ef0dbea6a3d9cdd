use crate::error::RequestError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Other,
}

/// Where repositories come from and how their working copies are read.
#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Depth-1, single-branch clone of `url` into `dir`, replacing whatever is there.
    async fn clone_repo(
        &self,
        url: &str,
        git_ref: Option<&str>,
        dir: &Path,
    ) -> Result<(), RequestError>;

    /// Remote refs (`refs/heads/...`, `refs/tags/...`) starting with `prefix`.
    async fn list_server_refs(&self, url: &str, prefix: &str)
        -> Result<Vec<String>, RequestError>;

    async fn read_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn stat(&self, path: &Path) -> io::Result<EntryKind> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(if metadata.is_dir() {
            EntryKind::Dir
        } else if metadata.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        })
    }

    async fn read_file(&self, path: &Path) -> io::Result<String> {
        tokio::fs::read_to_string(path).await
    }
}

/// [`RepoSource`] backed by the `git` executable.
pub struct GitCli {
    binary: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, mut command: Command) -> Result<String, String> {
        let output = command.output().await.map_err(|err| err.to_string())?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

#[async_trait]
impl RepoSource for GitCli {
    async fn clone_repo(
        &self,
        url: &str,
        git_ref: Option<&str>,
        dir: &Path,
    ) -> Result<(), RequestError> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(dir = %dir.display(), "Replacing existing working copy"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut command = self.command();
        command.args(["clone", "--depth", "1", "--single-branch"]);
        if let Some(git_ref) = git_ref {
            command.arg("--branch").arg(short_ref(git_ref));
        }
        command.arg(url).arg(dir);

        self.run(command)
            .await
            .map_err(|message| RequestError::CloneFailure {
                url: url.to_string(),
                message,
            })?;

        info!(url, git_ref, dir = %dir.display(), "Cloned repository");
        Ok(())
    }

    async fn list_server_refs(
        &self,
        url: &str,
        prefix: &str,
    ) -> Result<Vec<String>, RequestError> {
        let mut command = self.command();
        command.args(["ls-remote", "--heads", "--tags"]).arg(url);

        let output = self
            .run(command)
            .await
            .map_err(|message| RequestError::CloneFailure {
                url: url.to_string(),
                message,
            })?;
        Ok(parse_ls_remote(&output, prefix))
    }
}

/// `git clone --branch` wants a bare branch or tag name.
fn short_ref(git_ref: &str) -> &str {
    git_ref
        .strip_prefix("refs/heads/")
        .or_else(|| git_ref.strip_prefix("refs/tags/"))
        .unwrap_or(git_ref)
}

fn parse_ls_remote(output: &str, prefix: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .filter(|name| !name.ends_with("^{}") && name.starts_with(prefix))
        .map(str::to_string)
        .collect()
}

/// Directory listing handed to the file selector: two spaces of indent per depth,
/// directories suffixed with `/`, dot-directories and empty directories left out.
pub async fn file_tree(source: &dyn RepoSource, root: &Path) -> Vec<String> {
    let mut lines = Vec::new();
    collect_tree(source, root, 0, &mut lines).await;
    lines
}

fn collect_tree<'a>(
    source: &'a dyn RepoSource,
    dir: &'a Path,
    depth: usize,
    lines: &'a mut Vec<String>,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let entries = match source.read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "Failed to read directory");
                return;
            }
        };

        let indent = "  ".repeat(depth);
        for name in entries {
            let path = dir.join(&name);
            let kind = match source.stat(&path).await {
                Ok(kind) => kind,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "Skipping unreadable entry");
                    continue;
                }
            };

            match kind {
                EntryKind::Dir => {
                    if name.starts_with('.') {
                        continue;
                    }
                    let mut children = Vec::new();
                    collect_tree(source, &path, depth + 1, &mut children).await;
                    if !children.is_empty() {
                        lines.push(format!("{indent}{name}/"));
                        lines.extend(children);
                    }
                }
                EntryKind::File => lines.push(format!("{indent}{name}")),
                EntryKind::Other => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn short_ref_strips_namespace() {
        assert_eq!(short_ref("refs/heads/feature/x"), "feature/x");
        assert_eq!(short_ref("refs/tags/v1.0"), "v1.0");
        assert_eq!(short_ref("main"), "main");
    }

    #[test]
    fn parse_ls_remote_filters_by_prefix_and_drops_peeled_tags() {
        let output = "\
aaa\trefs/heads/main
bbb\trefs/heads/feature/x
ccc\trefs/tags/v1.0
ddd\trefs/tags/v1.0^{}
";
        assert_eq!(
            parse_ls_remote(output, "refs/heads/"),
            vec!["refs/heads/main".to_string(), "refs/heads/feature/x".to_string()]
        );
        assert_eq!(
            parse_ls_remote(output, "refs/tags/v1"),
            vec!["refs/tags/v1.0".to_string()]
        );
    }

    #[tokio::test]
    async fn file_tree_indents_and_skips_hidden_and_empty_dirs() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/parser")).unwrap();
        std::fs::create_dir_all(root.join(".git/objects")).unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        std::fs::write(root.join(".git/objects/pack"), "x").unwrap();
        std::fs::write(root.join("README.md"), "# widgets").unwrap();
        std::fs::write(root.join(".gitignore"), "target").unwrap();
        std::fs::write(root.join("src/lib.rs"), "").unwrap();
        std::fs::write(root.join("src/parser/mod.rs"), "").unwrap();

        let tree = file_tree(&GitCli::default(), root).await;

        assert_eq!(
            tree,
            vec![
                ".gitignore".to_string(),
                "README.md".to_string(),
                "src/".to_string(),
                "  lib.rs".to_string(),
                "  parser/".to_string(),
                "    mod.rs".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn file_tree_of_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let tree = file_tree(&GitCli::default(), &dir.path().join("missing")).await;
        assert!(tree.is_empty());
    }
}
