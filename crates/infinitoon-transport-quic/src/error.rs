//! quinn errors mapped onto [`TransportError`]

use infinitoon_transport::TransportError;
use quinn::{ConnectError, ConnectionError, ReadError, VarInt, WriteError};

pub(crate) fn from_connection(err: ConnectionError) -> TransportError {
    match err {
        ConnectionError::ApplicationClosed(frame) => TransportError::ClosedByPeer {
            code: frame.error_code.into_inner(),
            reason: String::from_utf8_lossy(&frame.reason).into_owned(),
        },
        ConnectionError::TimedOut => TransportError::IdleTimeout,
        other => TransportError::ConnectionError(other.to_string()),
    }
}

pub(crate) fn from_connect(err: ConnectError) -> TransportError {
    match err {
        ConnectError::InvalidServerName(name) => {
            TransportError::ConfigurationError(format!("Invalid server name: {}", name))
        }
        other => TransportError::ConnectionError(other.to_string()),
    }
}

pub(crate) fn from_read(err: ReadError) -> TransportError {
    match err {
        ReadError::ConnectionLost(e) => from_connection(e),
        ReadError::ClosedStream => TransportError::StreamClosed,
        ReadError::Reset(code) => from_stream_code(code, "stream reset"),
        other => TransportError::ConnectionError(other.to_string()),
    }
}

pub(crate) fn from_write(err: WriteError) -> TransportError {
    match err {
        WriteError::ConnectionLost(e) => from_connection(e),
        WriteError::ClosedStream => TransportError::StreamClosed,
        WriteError::Stopped(code) => from_stream_code(code, "stream stopped"),
        other => TransportError::ConnectionError(other.to_string()),
    }
}

/// A stream aborted with code 0 ended normally; anything else is the peer's error
fn from_stream_code(code: VarInt, reason: &str) -> TransportError {
    match code.into_inner() {
        0 => TransportError::StreamClosed,
        code => TransportError::ClosedByPeer {
            code,
            reason: reason.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infinitoon_transport::FailureKind;

    #[test]
    fn test_idle_timeout() {
        assert_eq!(
            from_connection(ConnectionError::TimedOut).kind(),
            FailureKind::IdleTimeout
        );
        assert!(matches!(
            from_read(ReadError::ConnectionLost(ConnectionError::TimedOut)),
            TransportError::IdleTimeout
        ));
    }

    #[test]
    fn test_reset_is_connection_loss() {
        let err = from_connection(ConnectionError::Reset);
        assert!(matches!(err, TransportError::ConnectionError(_)));
        assert_eq!(err.kind(), FailureKind::Other);
    }

    #[test]
    fn test_closed_streams() {
        assert_eq!(
            from_read(ReadError::ClosedStream).kind(),
            FailureKind::GracefulClose
        );
        assert_eq!(
            from_write(WriteError::ClosedStream).kind(),
            FailureKind::GracefulClose
        );
    }

    #[test]
    fn test_aborted_streams_carry_their_code() {
        let reset = from_read(ReadError::Reset(VarInt::from_u32(7)));
        assert!(matches!(reset, TransportError::ClosedByPeer { code: 7, .. }));
        assert_eq!(reset.kind(), FailureKind::Other);

        let stopped = from_write(WriteError::Stopped(VarInt::from_u32(9)));
        assert!(matches!(stopped, TransportError::ClosedByPeer { code: 9, .. }));
        assert_eq!(stopped.kind(), FailureKind::Other);

        assert_eq!(
            from_read(ReadError::Reset(VarInt::from_u32(0))).kind(),
            FailureKind::GracefulClose
        );
        assert_eq!(
            from_write(WriteError::Stopped(VarInt::from_u32(0))).kind(),
            FailureKind::GracefulClose
        );
    }

    #[test]
    fn test_bad_server_name_is_fatal() {
        let err = from_connect(ConnectError::InvalidServerName("bad name".to_string()));
        assert_eq!(err.kind(), FailureKind::Fatal);
    }
}
