use crate::scheduler::PlaybackState;

/// Result alias that carries the custom [`SessionError`] type.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Unknown feature ids, malformed catalogs and timelines failing
    /// validation. Fatal when raised while loading; playback never starts.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A stored setting value could not be used as declared. Recovered by
    /// falling back to the declared default.
    #[error("setting `{key}` of feature `{feature_id}` could not be coerced: {reason}")]
    ValueCoercion {
        feature_id: String,
        key: String,
        reason: String,
    },
    /// A feature back-end rejected a call. Recovered; playback continues.
    #[error("feature `{feature_id}` back-end failed: {message}")]
    Sink { feature_id: String, message: String },
    /// The scheduler was asked to do something its current state forbids.
    #[error("cannot {action} while the scheduler is {state}")]
    SchedulerState {
        action: &'static str,
        state: PlaybackState,
    },
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around (de)serialization failures of persisted documents.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Creates a configuration error that simply wraps the provided message.
    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn sink(feature_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sink {
            feature_id: feature_id.into(),
            message: message.into(),
        }
    }

    pub(crate) fn coercion(
        feature_id: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ValueCoercion {
            feature_id: feature_id.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors that playback recovers from on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ValueCoercion { .. } | Self::Sink { .. })
    }
}
