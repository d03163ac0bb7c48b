use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(
        "server responded 403 for {url}, the content has most likely been removed upstream"
    )]
    ContentRemoved { url: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("chunk {index} ({url}) failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        index: u64,
        url: String,
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("download manager already started")]
    AlreadyStarted,

    #[error("download is already paused")]
    AlreadyPaused,

    #[error("download is not paused")]
    AlreadyResumed,

    #[error("invalid download request: {reason}")]
    InvalidRequest { reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("download aborted")]
    Aborted,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn content_removed(url: impl Into<String>) -> Self {
        Self::ContentRemoved { url: url.into() }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Classifies a response status, mapping 403 to the permanent variant.
    pub fn from_status(status: StatusCode, url: impl Into<String>) -> Self {
        if status == StatusCode::FORBIDDEN {
            Self::content_removed(url)
        } else {
            Self::http_status(status, url)
        }
    }

    /// Errors that abort the pool on first sight, without consuming retries.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::ContentRemoved { .. }
            | Self::RetriesExhausted { .. }
            | Self::AlreadyStarted
            | Self::AlreadyPaused
            | Self::AlreadyResumed
            | Self::InvalidRequest { .. }
            | Self::Playlist { .. }
            | Self::Aborted
            | Self::Internal { .. } => true,
            Self::HttpStatus { .. } | Self::Network { .. } | Self::Io { .. } => false,
        }
    }

    /// Errors worth another attempt of the same chunk.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HttpStatus { .. } | Self::Network { .. } | Self::Io { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_maps_to_content_removed() {
        let err = DownloadError::from_status(StatusCode::FORBIDDEN, "https://cdn/x/1.ts");
        assert!(matches!(err, DownloadError::ContentRemoved { .. }));
        assert!(err.is_permanent());
        assert!(!err.is_retryable());
    }

    #[test]
    fn other_statuses_are_transient() {
        for status in [
            StatusCode::NOT_FOUND,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            let err = DownloadError::from_status(status, "https://cdn/x/1.ts");
            assert!(err.is_retryable(), "{status} should be retried");
            assert!(!err.is_permanent());
        }
    }

    #[test]
    fn exhausted_retries_keep_the_last_cause() {
        let err = DownloadError::RetriesExhausted {
            index: 7,
            url: "https://cdn/x/7.ts".to_string(),
            attempts: 6,
            source: Box::new(DownloadError::http_status(
                StatusCode::BAD_GATEWAY,
                "https://cdn/x/7.ts",
            )),
        };
        assert!(err.is_permanent());
        let message = err.to_string();
        assert!(message.contains("chunk 7"));
        assert!(message.contains("6 attempts"));
    }
}
