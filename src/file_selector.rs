use crate::ai_sdk::CompletionService;
use crate::cancel::OrCancelExt;
use crate::error::RequestError;
use crate::protocol::ChatMessage;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

static SELECTED_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[\s*(.*?)\s*\]\]").unwrap());

pub fn selection_prompt(file_tree: &str, query: &str) -> String {
    format!(
        "The following files are found in the repository:
{file_tree}
Please provide a list of files that you would like to search for answering the user query.
Enclose the file paths in a list in a markdown code block as shown below:
```
1. [[ filepath_1 ]]

2. [[ filepath_2 ]]

3. [[ filepath_3 ]]

...
```
Think step-by-step and strategically reason about the files you choose to maximize the chances of finding the answer to the query. Only pick the files that are most likely to contain the information you are looking for in decreasing order of relevance. Once you have selected the files, please submit your response in the appropriate format mentioned above (markdown numbered list in a markdown code block). The filepath within [[ and ]] should contain the complete path of the file in the repository.
{query}"
    )
}

/// Paths from `[[ path ]]` markers, one per line, first occurrence order, no duplicates.
pub fn parse_selection(reply: &str) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();
    for line in reply.lines() {
        let Some(captures) = SELECTED_PATH.captures(line) else {
            continue;
        };
        let path = captures[1].trim();
        if !path.is_empty() && !selected.iter().any(|seen| seen == path) {
            selected.push(path.to_string());
        }
    }
    selected
}

/// Asks the model which files answer `query`. An unparseable reply yields no files.
pub async fn select_files(
    service: &dyn CompletionService,
    model: &str,
    file_tree: &str,
    query: &str,
    cancel: &CancellationToken,
) -> Result<Vec<String>, RequestError> {
    let messages = [ChatMessage::user(selection_prompt(file_tree, query))];
    let mut stream = service
        .create_chat_completion(model, &messages, cancel)
        .or_cancel(cancel)
        .await??;

    let mut reply = String::new();
    while let Some(delta) = stream.next().or_cancel(cancel).await? {
        reply.push_str(&delta?);
    }

    let selected = parse_selection(&reply);
    if selected.is_empty() {
        warn!(model, reply_len = reply.len(), "Model selected no files");
    } else {
        info!(model, files = ?selected, "Selected grounding files");
    }
    Ok(selected)
}
