use std::io;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("networking disabled")]
    Disabled,
    #[error("no free connection slot for {0}")]
    NoFreeSlot(String),
    #[error("unsupported transport {family:?}/{protocol:?}")]
    Unsupported {
        family: crate::AddressFamily,
        protocol: crate::Protocol,
    },
    #[error("both loopback sides are in use")]
    NoLoopbackSide,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("missing host for {0}")]
    MissingHost(String),
    #[error("missing port for {0}")]
    MissingPort(String),
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("async runtime unavailable: {0}")]
    Runtime(String),
}

impl NetError {
    pub fn invalid_address(text: impl Into<String>) -> Self {
        Self::InvalidAddress(text.into())
    }

    pub fn connect(target: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            target: target.into(),
            source,
        }
    }
}

/// Outcome of handing one packet to a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    NoRoute,
    MtuExceeded,
    Disconnected,
}

impl SendStatus {
    pub fn is_sent(self) -> bool {
        self == SendStatus::Sent
    }

    /// Ranking used when several connections fail: anything that actually
    /// attempted the send beats `NoRoute`.
    pub fn specificity(self) -> u8 {
        match self {
            SendStatus::NoRoute => 0,
            SendStatus::Disconnected => 1,
            SendStatus::MtuExceeded => 2,
            SendStatus::Sent => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SendStatus::Sent => "sent",
            SendStatus::NoRoute => "no route",
            SendStatus::MtuExceeded => "mtu exceeded",
            SendStatus::Disconnected => "disconnected",
        }
    }
}

/// Errors reported by the stream file wrapper, mirroring the engine's
/// virtual-file error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VfsError {
    #[error("end of stream")]
    Eof,
    #[error("unspecified stream error")]
    Unspecified,
    #[error("peer stopped responding")]
    NoResponse,
    #[error("stream closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_specificity() {
        assert!(SendStatus::MtuExceeded.specificity() > SendStatus::NoRoute.specificity());
        assert!(SendStatus::Disconnected.specificity() > SendStatus::NoRoute.specificity());
        assert!(SendStatus::Sent.is_sent());
        assert!(!SendStatus::NoRoute.is_sent());
    }

    #[test]
    fn test_error_display() {
        let err = NetError::NoFreeSlot("CLUDP".into());
        assert_eq!(err.to_string(), "no free connection slot for CLUDP");
        let err = NetError::connect("example.org:80", io::ErrorKind::TimedOut.into());
        assert!(err.to_string().starts_with("connect to example.org:80 failed"));
    }
}
