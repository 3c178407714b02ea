// src/pipeline/error.rs
use std::io;

/// Why a single thumbnail request was dropped.
///
/// `Transfer`, `Status` and `EmptyBody` come from the byte fetch, `Decode` from
/// turning those bytes into pixels. None of them are retried.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("GET {url}: {reason}")]
    Transfer { url: String, reason: String },

    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("empty body for {url}")]
    EmptyBody { url: String },

    /// `url` is filled in by [`FetchError::with_url`] once the caller knows it.
    #[error("decode{}: {source}", url_suffix(.url))]
    Decode {
        url: Option<String>,
        source: image::ImageError,
    },
}

fn url_suffix(url: &Option<String>) -> String {
    url.as_deref().map(|u| format!(" {u}")).unwrap_or_default()
}

impl From<image::ImageError> for FetchError {
    fn from(source: image::ImageError) -> Self {
        Self::Decode { url: None, source }
    }
}

impl FetchError {
    pub const fn is_transfer(&self) -> bool {
        matches!(
            self,
            Self::Transfer { .. } | Self::Status { .. } | Self::EmptyBody { .. }
        )
    }

    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }

    /// Attach `url` to a decode error that doesn't carry one yet.
    pub fn with_url(self, url: &str) -> Self {
        match self {
            Self::Decode { url: None, source } => Self::Decode {
                url: Some(url.to_string()),
                source,
            },
            other => other,
        }
    }
}

/// Failures while building or starting the pipeline itself.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("http client build failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("failed to spawn worker thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("worker `{0}` already started")]
    AlreadyStarted(String),
}

/// What happened to a finished fetch once it reached the polling thread.
///
/// `Superseded` and `Stopped` are the expected result of slots being
/// reassigned faster than downloads finish; they are not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Superseded,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::FetchError;

    #[test]
    fn classifies_transfer_and_decode() {
        let transfer = FetchError::Status {
            url: "http://example.invalid/a.jpg".into(),
            status: 404,
        };
        assert!(transfer.is_transfer());
        assert!(!transfer.is_decode());
        assert_eq!(
            transfer.to_string(),
            "HTTP 404 for http://example.invalid/a.jpg"
        );

        let decode: FetchError = image::load_from_memory(b"not an image")
            .expect_err("garbage must not decode")
            .into();
        assert!(decode.is_decode());
        assert!(!decode.is_transfer());
        assert!(decode.to_string().starts_with("decode: "));

        let named = decode.with_url("http://example.invalid/b.jpg");
        assert!(named
            .to_string()
            .starts_with("decode http://example.invalid/b.jpg: "));
    }
}
