//! Error taxonomy shared by every gateway component.
//!
//! Each variant carries a stable machine name (used in the JSON body of HTTP
//! error responses) and an HTTP status code. Asynchronous transports have no
//! response to answer, so they log the same errors and drop the message.

use thiserror::Error;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error type for gateway operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Malformed Ultralight payload
    #[error("Error parsing Ultralight payload: {0}")]
    Parse(String),

    /// Wrong content type on a POST measure request
    #[error("Unsupported content type: {0}")]
    UnsupportedType(String),

    /// One or more mandatory query parameters missing
    #[error("Some of the mandatory params weren't found in the request: {0}")]
    MandatoryParamsNotFound(String),

    /// No configuration group registered for the apikey
    #[error("Group not found for resource {resource} and apikey {api_key}")]
    GroupNotFound { resource: String, api_key: String },

    /// Device lookup miss
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device command endpoint answered with an error
    #[error("Error in the device HTTP command endpoint: {0}")]
    HttpCommandResponse(String),

    /// Startup or routing configuration defect
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Context sink rejected or failed a call
    #[error("Sink error: {0}")]
    Sink(String),

    /// Socket or broker level failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    /// Stable error name reported to HTTP clients.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Parse(_) => "PARSE_ERROR",
            Self::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            Self::MandatoryParamsNotFound(_) => "MANDATORY_PARAMS_NOT_FOUND",
            Self::GroupNotFound { .. } => "GROUP_NOT_FOUND",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::HttpCommandResponse(_) => "HTTP_COMMAND_RESPONSE_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Sink(_) => "SINK_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Parse(_)
            | Self::UnsupportedType(_)
            | Self::MandatoryParamsNotFound(_)
            | Self::HttpCommandResponse(_) => 400,
            Self::GroupNotFound { .. } | Self::DeviceNotFound(_) => 404,
            Self::Configuration(_) => 501,
            Self::Sink(_) | Self::Transport(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names_and_status() {
        let err = GatewayError::Parse("empty payload".to_string());
        assert_eq!(err.name(), "PARSE_ERROR");
        assert_eq!(err.status_code(), 400);

        let err = GatewayError::GroupNotFound {
            resource: "/iot/d".to_string(),
            api_key: "1234".to_string(),
        };
        assert_eq!(err.status_code(), 404);
        assert!(err.to_string().contains("1234"));

        assert_eq!(
            GatewayError::Configuration("no binding".into()).status_code(),
            501
        );
    }
}
