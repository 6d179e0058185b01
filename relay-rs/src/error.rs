use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    /// Allow-list entry that does not parse at evaluation time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Settings rejected before anything was written
    #[error("Validation error: {0}")]
    Validation(String),

    /// Settings file exists but is not valid
    #[error("Format error: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Remote server replied {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl RelayError {
    /// Whether a later attempt could succeed without changing the message.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Remote { code, .. } => *code < 500,
            RelayError::Malformed(_) | RelayError::Validation(_) | RelayError::Format(_) => false,
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
