//! Builds the grounding message sent as the first user turn of a conversation.

use crate::cancel::OrCancelExt;
use crate::error::RequestError;
use crate::protocol::FirstMessageItem;
use crate::repo_source::RepoSource;
use futures::future::join_all;
use std::path::{Component, Path};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const SEPARATOR: &str = "___";

const FILES_INTRO: &str =
    "Here is a list of files in the repository that may help you answer the query:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedFile {
    /// Relative to the repository root.
    pub path: String,
    pub content: String,
}

pub fn assemble(repo_name: &str, files: Vec<LoadedFile>, query: &str) -> Vec<FirstMessageItem> {
    let mut items = Vec::with_capacity(files.len() + 3);
    items.push(FirstMessageItem::text(FILES_INTRO));
    items.extend(files.into_iter().map(|file| FirstMessageItem::File {
        file_path: file.path,
        file_content: file.content,
    }));
    items.push(FirstMessageItem::text(SEPARATOR));
    items.push(FirstMessageItem::text(format!(
        "[INSTRUCTION]

You are an expert software engineer. Answer the following user query using provided context retrieved from the `{repo_name}` repository.

[USER QUERY]

{query}"
    )));
    items
}

/// Plain-text rendering sent to the model.
pub fn format_first_message(items: &[FirstMessageItem]) -> String {
    items
        .iter()
        .map(|item| match item {
            FirstMessageItem::Text { text } => text.clone(),
            FirstMessageItem::File {
                file_path,
                file_content,
            } => {
                let fence = fence_for(file_content);
                format!("FILE: {file_path}\n{fence}\n{file_content}\n{fence}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// A backtick fence longer than any run inside `content`.
fn fence_for(content: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for c in content.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat((longest + 1).max(3))
}

/// Reads the selected files (relative to `folder`) concurrently. Files that cannot be read,
/// or whose path escapes the folder, are dropped.
pub async fn load_files(
    source: &dyn RepoSource,
    repo_dir: &Path,
    folder: &str,
    selected: &[String],
    cancel: &CancellationToken,
) -> Result<Vec<LoadedFile>, RequestError> {
    let base = if folder.is_empty() {
        repo_dir.to_path_buf()
    } else {
        repo_dir.join(folder)
    };

    let reads = selected.iter().map(|selected_path| {
        let base = &base;
        async move {
            let relative = selected_path.trim_start_matches("./").trim_start_matches('/');
            if !is_contained(relative) {
                debug!(path = %selected_path, "Dropping selected path outside the repository");
                return None;
            }
            match source.read_file(&base.join(relative)).await {
                Ok(content) => Some(LoadedFile {
                    path: if folder.is_empty() {
                        relative.to_string()
                    } else {
                        format!("{folder}/{relative}")
                    },
                    content,
                }),
                Err(err) => {
                    debug!(path = %relative, error = %err, "Dropping unreadable selected file");
                    None
                }
            }
        }
    });

    let loaded = join_all(reads).or_cancel(cancel).await?;
    Ok(loaded.into_iter().flatten().collect())
}

fn is_contained(relative: &str) -> bool {
    !relative.is_empty()
        && Path::new(relative)
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}
