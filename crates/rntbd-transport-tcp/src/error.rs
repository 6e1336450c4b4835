use rntbd_core::TransportError;
use std::io;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "rntbd.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const NEGOTIATE: OperationKind = OperationKind {
    code: "rntbd.tcp.negotiate_failed",
    message: "rntbd context negotiation",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "rntbd.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "rntbd.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "rntbd.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "rntbd.tcp.configure_failed",
    message: "tcp configure",
};

/// 将 IO 错误映射为传输错误。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    TransportError::Io {
        operation: kind.message,
        source: error,
    }
}

/// 建连或协商超时。
pub(crate) fn timeout_error(kind: OperationKind) -> TransportError {
    TransportError::ConnectTimeout {
        operation: kind.message,
    }
}

/// 对端主动断开一类的错误，日志降级为 `debug`。
pub(crate) fn is_disconnect(error: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_operation_and_source() {
        let err = map_io_error(
            WRITE,
            io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"),
        );
        assert_eq!(err.code(), "rntbd.channel.io");
        assert!(err.to_string().starts_with("tcp write failed"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn resets_count_as_disconnects() {
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_disconnect(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
