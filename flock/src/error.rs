use thiserror::Error as ThisError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while binding or executing an LLM-backed function.
///
/// Every variant surfaces as a query failure; the engine never retries internally.
#[derive(ThisError, Debug)]
pub enum Error {
    /// No model with this name has been created
    #[error("Model '{name}' not found")]
    UnknownModel { name: String },

    /// `CREATE MODEL` was issued twice for the same name
    #[error("Model '{name}' already exists")]
    ModelAlreadyExists { name: String },

    /// The prompt template is empty, or rendered to an empty string
    #[error("Prompt for {function} is empty")]
    EmptyPrompt { function: String },

    /// A required positional argument or option was not supplied
    #[error("{function} is missing required argument '{argument}'")]
    MissingArgument { function: String, argument: String },

    /// An argument was supplied but could not be interpreted
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The provider does not implement the requested operation
    #[error("{capability} is not supported by the {provider} provider")]
    UnsupportedCapability { provider: String, capability: String },

    /// An audio context column has no transcription model attached
    #[error("Audio context column '{column}' requires a transcription_model")]
    MissingTranscriptionModel { column: String },

    /// A structured response did not satisfy the caller's schema
    #[error("Response failed schema validation: {}", errors.join("; "))]
    SchemaValidation { errors: Vec<String> },

    /// The provider call failed (transport, non-success status, refusal or error body)
    #[error("{provider} request failed: {message}")]
    Provider { provider: String, message: String },

    /// The provider stopped because it ran out of output tokens
    #[error("{provider} response exceeded the maximum output tokens")]
    ExceededMaxOutputTokens { provider: String },

    /// The provider returned a different number of answers than rows in the chunk
    #[error("Malformed batch response: expected {expected} items, got {actual}")]
    MalformedBatchResponse { expected: usize, actual: usize },

    /// No credentials are configured for a provider
    #[error("No {secret} configured for the {provider} provider")]
    MissingSecret { provider: String, secret: String },

    /// A chunk call failed while computing one group
    #[error("{function} failed on group {group}, chunk {chunk}: {source}")]
    Chunk {
        function: String,
        group: String,
        chunk: usize,
        #[source]
        source: Box<Error>,
    },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stable classification of an [`Error`], looking through chunk wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnknownModel,
    ModelAlreadyExists,
    EmptyPrompt,
    MissingArgument,
    InvalidArgument,
    UnsupportedCapability,
    MissingTranscriptionModel,
    SchemaValidationFailure,
    ProviderFailure,
    ExceededMaxOutputTokens,
    MalformedBatchResponse,
    MissingSecret,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownModel { .. } => ErrorKind::UnknownModel,
            Error::ModelAlreadyExists { .. } => ErrorKind::ModelAlreadyExists,
            Error::EmptyPrompt { .. } => ErrorKind::EmptyPrompt,
            Error::MissingArgument { .. } => ErrorKind::MissingArgument,
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::UnsupportedCapability { .. } => ErrorKind::UnsupportedCapability,
            Error::MissingTranscriptionModel { .. } => ErrorKind::MissingTranscriptionModel,
            Error::SchemaValidation { .. } => ErrorKind::SchemaValidationFailure,
            Error::Provider { .. } | Error::Http(_) => ErrorKind::ProviderFailure,
            Error::ExceededMaxOutputTokens { .. } => ErrorKind::ExceededMaxOutputTokens,
            Error::MalformedBatchResponse { .. } => ErrorKind::MalformedBatchResponse,
            Error::MissingSecret { .. } => ErrorKind::MissingSecret,
            Error::Chunk { source, .. } => source.kind(),
            Error::Json(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Attach the failing group and chunk to an execution error.
    pub fn in_chunk(self, function: &str, group: &str, chunk: usize) -> Self {
        Error::Chunk {
            function: function.to_string(),
            group: group.to_string(),
            chunk,
            source: Box::new(self),
        }
    }

    pub(crate) fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_looks_through_chunk_wrapper() {
        let err = Error::MalformedBatchResponse { expected: 3, actual: 2 }.in_chunk("llm_reduce", "g1", 4);
        assert_eq!(err.kind(), ErrorKind::MalformedBatchResponse);

        let message = err.to_string();
        assert!(message.contains("llm_reduce"));
        assert!(message.contains("group g1"));
        assert!(message.contains("chunk 4"));
        assert!(message.contains("expected 3 items, got 2"));
    }

    #[test]
    fn test_unsupported_capability_names_provider() {
        let err = Error::UnsupportedCapability {
            provider: "Ollama".to_string(),
            capability: "Audio transcription".to_string(),
        };
        assert_eq!(err.to_string(), "Audio transcription is not supported by the Ollama provider");
    }
}
