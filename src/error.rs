use crate::ai_sdk::CompletionError;

/// Failures that terminate a chat request. Each maps to one `error` or `aborted` event.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Repo url not provided.")]
    MissingRepoUrl,
    #[error("failed to clone {url}: {message}")]
    CloneFailure { url: String, message: String },
    #[error(transparent)]
    Completion(CompletionError),
    #[error("request aborted")]
    Aborted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RequestError {
    /// Stable name carried in the `error{name, message}` event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MissingRepoUrl => "MissingRepoUrl",
            Self::CloneFailure { .. } => "CloneFailure",
            Self::Completion(_) => "CompletionServiceError",
            Self::Aborted => "StreamAborted",
            Self::Io(_) => "IoError",
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

impl From<CompletionError> for RequestError {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::Aborted => Self::Aborted,
            other => Self::Completion(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_completion_maps_to_aborted_request() {
        let err: RequestError = CompletionError::Aborted.into();
        assert!(err.is_aborted());
        assert_eq!(err.name(), "StreamAborted");
    }

    #[test]
    fn api_failure_stays_a_completion_error() {
        let err: RequestError = CompletionError::Api {
            status: 500,
            body: "model not loaded".to_string(),
        }
        .into();
        assert!(!err.is_aborted());
        assert_eq!(err.name(), "CompletionServiceError");
        assert_eq!(err.to_string(), "API error: 500 - model not loaded");
    }
}
