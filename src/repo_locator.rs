//! Turns a free-form question (or a browser tab URL) into a clonable repository location.
//!
//! A `/tree/<rest>` or `/blob/<rest>` suffix is split into a ref and a folder path. Branch
//! names may contain slashes, so the split is settled against the remote's branch list:
//! the longest `refs/heads/<prefix of rest>` that exists wins and the remainder becomes the
//! folder. This stays ambiguous when both `a` and `a/b` exist as branches: for
//! `tree/a/b/c` the result is branch `a/b`, folder `c`, even if branch `a`, folder `b/c`
//! was meant.

use crate::error::RequestError;
use crate::repo_source::RepoSource;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path};
use tracing::{debug, warn};

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"https?://(www\.)?[-a-zA-Z0-9@:%._+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}\b([-a-zA-Z0-9()@:%_+.~#?&/=]*)",
    )
    .unwrap()
});

const FALLBACK_REPO_NAME: &str = "repo";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoInfo {
    pub repo_url: Option<String>,
    pub repo_name: Option<String>,
    pub git_ref: Option<String>,
    pub folder_path: String,
    pub query: String,
    /// Everything after `tree/` or `blob/`, before it is split into ref and folder.
    ref_path: Option<String>,
}

/// First well-formed URL in `input`.
pub fn find_url(input: &str) -> Option<&str> {
    URL_PATTERN.find(input).map(|m| m.as_str())
}

/// Appends `.git` to a repository URL unless present; idempotent.
pub fn normalize_repo_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.ends_with(".git") {
        url.to_string()
    } else {
        format!("{url}.git")
    }
}

pub fn extract_repo_info(input: &str) -> RepoInfo {
    let Some(found) = URL_PATTERN.find(input) else {
        return RepoInfo {
            query: input.to_string(),
            ..RepoInfo::default()
        };
    };

    let query = input[found.end()..].trim().to_string();
    let (base, ref_path) = split_tree_suffix(strip_query_and_fragment(found.as_str()));
    let repo_url = normalize_repo_url(base);
    let repo_name = repo_name(&repo_url);

    let (git_ref, folder_path) = match ref_path.as_deref() {
        Some(raw) => match raw.split_once('/') {
            Some((first, rest)) => (Some(first.to_string()), folder_within_repo(rest)),
            None => (Some(raw.to_string()), String::new()),
        },
        None => (None, String::new()),
    };

    debug!(%repo_url, %repo_name, ?git_ref, %folder_path, "Extracted repository info");

    RepoInfo {
        repo_url: Some(repo_url),
        repo_name: Some(repo_name),
        git_ref,
        folder_path,
        query,
        ref_path,
    }
}

/// Uses the URL in `message` when there is one, otherwise the session's tab URL; the
/// message then is the query verbatim.
pub fn locate(message: &str, tab_url: &str) -> Result<RepoInfo, RequestError> {
    let info = extract_repo_info(message);
    if info.repo_url.is_some() {
        return Ok(info);
    }

    let tab = extract_repo_info(tab_url);
    if tab.repo_url.is_none() {
        return Err(RequestError::MissingRepoUrl);
    }
    Ok(RepoInfo {
        query: message.trim().to_string(),
        ..tab
    })
}

/// Settles the ref/folder split against the remote's branches.
pub async fn resolve_ref(source: &dyn RepoSource, info: &mut RepoInfo) -> Result<(), RequestError> {
    let (Some(url), Some(raw)) = (info.repo_url.clone(), info.ref_path.clone()) else {
        return Ok(());
    };

    let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
    let mut matched = None;
    for len in 1..=segments.len() {
        let candidate = format!("refs/heads/{}", segments[..len].join("/"));
        let refs = source.list_server_refs(&url, &candidate).await?;
        if refs.is_empty() {
            break;
        }
        if refs.iter().any(|name| *name == candidate) {
            matched = Some((candidate, len));
        }
    }

    match matched {
        Some((git_ref, len)) => {
            info.folder_path = folder_within_repo(&segments[len..].join("/"));
            info.git_ref = Some(git_ref);
        }
        // Not a branch: a tag or commit-ish keeps the single-segment split.
        None => debug!(%url, %raw, "No branch matched ref path"),
    }
    Ok(())
}

fn strip_query_and_fragment(url: &str) -> &str {
    match url.find(['?', '#']) {
        Some(idx) => &url[..idx],
        None => url,
    }
}

/// Splits `https://host/owner/repo/tree/<rest>` (or GitLab's `/-/tree/`) into the
/// repository URL and `<rest>`.
fn split_tree_suffix(url: &str) -> (&str, Option<String>) {
    let Some(scheme_end) = url.find("://") else {
        return (url, None);
    };
    let path_start = match url[scheme_end + 3..].find('/') {
        Some(idx) => scheme_end + 3 + idx,
        None => return (url, None),
    };

    let mut offset = path_start;
    let mut index = 0;
    for segment in url[path_start + 1..].split('/') {
        let start = offset + 1;
        if index >= 2 && (segment == "tree" || segment == "blob") {
            let rest = url[start + segment.len()..].trim_matches('/');
            if rest.is_empty() {
                break;
            }
            let base = url[..offset].trim_end_matches("/-");
            return (base, Some(rest.to_string()));
        }
        offset = start + segment.len();
        index += 1;
    }
    (url, None)
}

/// A folder that would leave the working copy (`..`, `.`) falls back to the repository root.
fn folder_within_repo(folder: &str) -> String {
    let folder = folder.trim_matches('/');
    let contained = Path::new(folder)
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if contained {
        folder.to_string()
    } else {
        warn!(%folder, "Ignoring folder path outside the repository");
        String::new()
    }
}

fn repo_name(repo_url: &str) -> String {
    repo_url
        .strip_suffix(".git")
        .and_then(|base| base.rsplit('/').next())
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .unwrap_or(FALLBACK_REPO_NAME)
        .to_string()
}
