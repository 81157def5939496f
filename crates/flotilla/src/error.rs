use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("malformed template: {0}")]
    MalformedTemplate(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },
}

impl FleetError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedTemplate(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn external(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalTool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Process exit status for a fatal error of this kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) | Self::MalformedTemplate(_) => 2,
            Self::NotFound(_) => 3,
            Self::Precondition(_) => 4,
            Self::ResourceExhausted(_) => 5,
            Self::ExternalTool { .. } => 6,
        }
    }
}

/// Find the typed error anywhere in an `anyhow` chain.
pub fn classify(err: &anyhow::Error) -> Option<&FleetError> {
    err.chain().find_map(|e| e.downcast_ref::<FleetError>())
}
