/// Result alias that carries the custom [`VisBridgeError`] type.
pub type Result<T> = std::result::Result<T, VisBridgeError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum VisBridgeError {
    /// Free-form failure that does not belong to a particular stage.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A configuration file could not be parsed.
    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),
    /// The protocol constants or runtime settings are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The audio device could not be opened or stopped delivering samples.
    #[error("audio capture failed: {0}")]
    Capture(String),
    /// The listener could not be bound or a client could not be served.
    #[error("streaming server failed: {0}")]
    Server(String),
}

impl VisBridgeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Audio backend failure.
    pub fn capture<T: Into<String>>(msg: T) -> Self {
        Self::Capture(msg.into())
    }

    /// Listener or client transport failure.
    pub fn server<T: Into<String>>(msg: T) -> Self {
        Self::Server(msg.into())
    }

    /// Rejected configuration value, reported before anything is opened.
    pub fn invalid_config<T: Into<String>>(msg: T) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<&str> for VisBridgeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for VisBridgeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_name_their_stage() {
        let err = VisBridgeError::capture("device unplugged");
        assert_eq!(err.to_string(), "audio capture failed: device unplugged");

        let err = VisBridgeError::server("address in use");
        assert_eq!(err.to_string(), "streaming server failed: address in use");
    }

    #[test]
    fn converts_from_strings() {
        let err: VisBridgeError = "plain".into();
        assert!(matches!(err, VisBridgeError::Message(ref m) if m == "plain"));
    }
}
