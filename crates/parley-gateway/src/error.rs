use thiserror::Error;
use uuid::Uuid;

/// Failure of a single relay operation.
///
/// Reported to the originating connection as an `error` event; the
/// connection carries on. Handshake failures are [`crate::auth::AuthError`].
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not a participant of chat {0}")]
    Authorization(Uuid),

    /// `context` is what the client sees; `source` stays in the logs.
    #[error("{context}")]
    Persistence {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed event: {0}")]
    Protocol(String),
}

impl RelayError {
    pub(crate) fn persistence(context: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::Persistence { context, source }
    }
}
