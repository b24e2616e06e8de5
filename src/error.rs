use thiserror::Error;

/// Failure while turning an image reference into bytes.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The platform could not resolve the reference to a download URL.
    #[error("failed to resolve file: {0}")]
    Resolve(String),

    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("HTTP error: {0}")]
    Status(reqwest::StatusCode),

    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),
}

/// Failure returned by the model client, including responses we cannot use.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to send request to Gemini: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Gemini API error ({status}): {message}")]
    Api {
        status: reqwest::StatusCode,
        message: String,
    },

    #[error("failed to parse Gemini response: {0}")]
    Decode(String),

    #[error("prompt blocked: {0}")]
    Blocked(String),

    #[error("model returned no candidates")]
    NoCandidates,

    #[error("model returned a candidate with no content parts (finish reason: {0})")]
    EmptyCandidate(String),
}

/// Everything that can go wrong while handling a single update. The
/// `Display` output is what the user sees after `Error: `.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Model(#[from] ModelError),
}
