//! Client error taxonomy
//!
//! A single [`Error`] enum covers every failure a caller can observe. Errors
//! recorded on the event loop become the failure cause of the owning
//! resource; any later operation on that resource fails fast with the same
//! cause, which is why the type is `Clone`.

use fe2o3_amqp_types::definitions::{self, AmqpError, ErrorCondition};
use fe2o3_amqp_types::sasl::SaslCode;

/// Errors surfaced to users of the client
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Transport level failure. Fatal for the connection, recoverable by
    /// reconnection when configured.
    #[error("io error ({kind:?}): {message}")]
    Io {
        /// Kind of the underlying [`std::io::Error`]
        kind: std::io::ErrorKind,
        /// Message of the underlying error
        message: String,
    },

    /// The peer closed the connection with a Close frame
    #[error("connection closed by remote peer: {}", DisplayCondition(.error))]
    ConnectionRemotelyClosed {
        /// Error condition carried by the remote Close, if any
        error: Option<definitions::Error>,
    },

    /// Authentication or authorization failed
    #[error("security error: {message}")]
    Security {
        /// Description of the failure
        message: String,
    },

    /// SASL negotiation ended with a non-OK outcome code
    #[error("SASL outcome code {code:?}")]
    Sasl {
        /// Outcome code reported by the server
        code: SaslCode,
        /// Additional data from the outcome frame, decoded lossily
        message: Option<String>,
    },

    /// The operation targeted a resource that is already closed, either
    /// locally or by the remote peer
    #[error("resource is closed: {message}")]
    ResourceClosed {
        /// Which resource and why
        message: String,
        /// Error condition from the remote Detach/End, if one was observed
        error: Option<definitions::Error>,
    },

    /// The operation did not complete within its configured timeout
    #[error("operation timed out")]
    OperationTimedOut,

    /// The remote peer does not support the requested capability
    #[error("unsupported by the remote peer: {message}")]
    UnsupportedOperation {
        /// Name of the missing capability
        message: String,
    },

    /// Programmatic misuse of the API
    #[error("illegal state: {message}")]
    IllegalState {
        /// What was violated
        message: String,
    },

    /// The delivery was aborted before it completed
    #[error("delivery was aborted")]
    DeliveryAborted,

    /// Encoding or decoding at the codec boundary failed
    #[error("codec error: {message}")]
    Codec {
        /// Message of the underlying serde_amqp error
        message: String,
    },

    /// A protocol violation attributable to the remote peer
    #[error("protocol error: {condition:?}: {message}")]
    Protocol {
        /// Condition that will be (or was) reported to the peer
        condition: ErrorCondition,
        /// Human readable description
        message: String,
    },
}

impl Error {
    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    pub(crate) fn resource_closed(message: impl Into<String>) -> Self {
        Self::ResourceClosed {
            message: message.into(),
            error: None,
        }
    }

    pub(crate) fn protocol(
        condition: impl Into<ErrorCondition>,
        message: impl Into<String>,
    ) -> Self {
        Self::Protocol {
            condition: condition.into(),
            message: message.into(),
        }
    }

    /// Whether the reconnect coordinator may retry after this error.
    ///
    /// IO errors, temporary SASL system errors and a remote Close carrying
    /// `amqp:connection:forced` are recoverable; everything else tears the
    /// connection down for good.
    pub(crate) fn is_recoverable(&self) -> bool {
        use fe2o3_amqp_types::definitions::ConnectionError;
        match self {
            Error::Io { .. } => true,
            Error::Sasl {
                code: SaslCode::SysTemp,
                ..
            } => true,
            Error::ConnectionRemotelyClosed { error: Some(err) } => {
                err.condition == ErrorCondition::ConnectionError(ConnectionError::ConnectionForced)
            }
            _ => false,
        }
    }

    /// Remaps a remote close carrying `amqp:unauthorized-access` to a
    /// security error so that rejected opens surface per the taxonomy.
    pub(crate) fn into_security_if_unauthorized(self) -> Self {
        match &self {
            Error::ConnectionRemotelyClosed { error: Some(err) }
                if err.condition == ErrorCondition::AmqpError(AmqpError::UnauthorizedAccess) =>
            {
                Error::Security {
                    message: err
                        .description
                        .clone()
                        .unwrap_or_else(|| "unauthorized access".to_string()),
                }
            }
            _ => self,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<serde_amqp::Error> for Error {
    fn from(err: serde_amqp::Error) -> Self {
        Self::Codec {
            message: err.to_string(),
        }
    }
}

struct DisplayCondition<'a>(&'a Option<definitions::Error>);

impl std::fmt::Display for DisplayCondition<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(err) => write!(
                f,
                "{:?} ({})",
                err.condition,
                err.description.as_deref().unwrap_or("")
            ),
            None => f.write_str("no error condition"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fe2o3_amqp_types::definitions::ConnectionError;

    #[test]
    fn io_errors_are_recoverable() {
        let err = Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(err.is_recoverable());
    }

    #[test]
    fn forced_close_is_recoverable_but_unauthorized_is_not() {
        let forced = Error::ConnectionRemotelyClosed {
            error: Some(definitions::Error::new(
                ConnectionError::ConnectionForced,
                Some("failover".to_string()),
                None,
            )),
        };
        assert!(forced.is_recoverable());

        let unauthorized = Error::ConnectionRemotelyClosed {
            error: Some(definitions::Error::new(
                AmqpError::UnauthorizedAccess,
                Some("no anonymous".to_string()),
                None,
            )),
        };
        assert!(!unauthorized.is_recoverable());
        assert!(matches!(
            unauthorized.into_security_if_unauthorized(),
            Error::Security { .. }
        ));
    }

    #[test]
    fn sasl_temp_failures_are_recoverable() {
        let temp = Error::Sasl {
            code: SaslCode::SysTemp,
            message: None,
        };
        let auth = Error::Sasl {
            code: SaslCode::Auth,
            message: None,
        };
        assert!(temp.is_recoverable());
        assert!(!auth.is_recoverable());
    }
}
