//! Error types for castwire

use thiserror::Error;

/// Result type alias using CastError
pub type Result<T> = std::result::Result<T, CastError>;

/// Main error type for castwire operations
///
/// The first six variants are the pipeline failure taxonomy. Per-unit errors
/// (`RecoverableCapture`, `Encode`, `MuxOrderViolation`) never leave the stage
/// that produced them; the rest escalate to the controller.
#[derive(Debug, Error)]
pub enum CastError {
    /// A single capture tick failed; the source retries at the next tick
    #[error("Capture error: {0}")]
    RecoverableCapture(String),

    /// A capture device disappeared and could not be recovered
    #[error("Source lost: {0}")]
    SourceLost(String),

    /// Encoding a single unit failed; the unit is dropped
    #[error("Encoder error: {0}")]
    Encode(String),

    /// A unit arrived with a timestamp earlier than its stream's last output
    #[error("Mux order violation: {0}")]
    MuxOrderViolation(String),

    /// Writing to the ingest connection failed
    #[error("Transport error: {0}")]
    TransportWrite(String),

    /// A resource needed at startup is unavailable
    #[error("Initialization failed: {0}")]
    FatalInit(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stream key could not be obtained
    #[error("Credential error: {0}")]
    Credentials(String),

    /// Operation not valid in the current pipeline state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CastError>,
    },
}

impl CastError {
    /// Create a recoverable capture error
    pub fn capture(msg: impl Into<String>) -> Self {
        Self::RecoverableCapture(msg.into())
    }

    /// Create a source lost error
    pub fn source_lost(msg: impl Into<String>) -> Self {
        Self::SourceLost(msg.into())
    }

    /// Create an encoder error
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportWrite(msg.into())
    }

    /// Create a startup error
    pub fn init(msg: impl Into<String>) -> Self {
        Self::FatalInit(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a credential error
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through context wrappers
    pub fn root(&self) -> &CastError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error ends a stage's lifecycle rather than a single unit
    pub fn is_fatal(&self) -> bool {
        match self.root() {
            Self::RecoverableCapture(_) | Self::Encode(_) | Self::MuxOrderViolation(_) => false,
            Self::TransportWrite(_) => false,
            _ => true,
        }
    }

    /// A short hint for the user on how to resolve the error
    pub fn user_hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::SourceLost(_) => {
                Some("Check that the display and microphone are still connected and permitted")
            }
            Self::TransportWrite(_) => {
                Some("Check your network connection and the ingest server address")
            }
            Self::FatalInit(_) => {
                Some("A capture device or encoder could not be opened; see the log for details")
            }
            Self::Config(_) => Some("Check ~/.config/castwire/config.toml"),
            Self::Credentials(_) => {
                Some("Set stream_key or the Twitch client_id/user_id in config.toml, or export CASTWIRE_STREAM_KEY")
            }
            _ => None,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}
