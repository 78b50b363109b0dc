use crate::engine::llm::{LlmError, LlmErrorKind};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the engine to synchronous callers.
///
/// Scheduled runs and optimization iterations swallow per-sample failures into
/// stored state; only interactive runs and bookkeeping failures reach callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing variable `{name}` in sample {sample_index}")]
    MissingVariable { name: String, sample_index: usize },

    #[error("sample {sample_index}: {source}")]
    Upstream {
        sample_index: usize,
        #[source]
        source: LlmError,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("no test runs found for prompt system {0}")]
    NoBaseline(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Upstream classification, when the error came from the model backend.
    pub fn upstream_kind(&self) -> Option<LlmErrorKind> {
        match self {
            Self::Upstream { source, .. } => Some(source.kind),
            _ => None,
        }
    }

    /// HTTP-style status for presentation layers.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingVariable { .. } | Self::NoBaseline(_) | Self::InvalidConfig(_) => 400,
            Self::Upstream { source, .. } => match source.kind {
                LlmErrorKind::Auth => 401,
                LlmErrorKind::Quota => 429,
                LlmErrorKind::Transport => 502,
                LlmErrorKind::Other => 500,
            },
            Self::NotFound { .. } => 404,
            Self::Storage(_) => 500,
        }
    }
}
