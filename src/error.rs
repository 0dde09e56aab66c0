use thiserror::Error;

/// Errors returned by the transport lifecycle and the master-side peer.
///
/// Timeouts are not errors: `read`/`write` report them as short counts.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("out of memory while allocating transport buffers")]
    OutOfMemory,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("bus transaction failed: {0}")]
    Bus(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            TransportError::InvalidArgument("capacity is zero").to_string(),
            "invalid argument: capacity is zero"
        );
        assert_eq!(
            TransportError::InvalidState("no device").to_string(),
            "invalid state: no device"
        );
    }
}
