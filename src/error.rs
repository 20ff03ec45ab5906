use thiserror::Error;

/// Error taxonomy for the secure-messaging core.
///
/// Every failure carries a stable kind tag and no variant ever holds
/// key material.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("crypto primitive failed: {0}")]
    Crypto(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("replayed message: counter {counter} at {timestamp}")]
    Replay { counter: u32, timestamp: i64 },

    #[error("malformed input: {0}")]
    Codec(String),

    #[error("peer verification failed: {0}")]
    Verify(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("usage error: {0}")]
    Usage(String),
}

impl Fault {
    /// Stable kind tag, suitable for logs and host-facing reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Fault::Crypto(_) => "crypto",
            Fault::Auth(_) => "auth",
            Fault::Replay { .. } => "replay",
            Fault::Codec(_) => "codec",
            Fault::Verify(_) => "verify",
            Fault::Transport(_) => "transport",
            Fault::Usage(_) => "usage",
        }
    }

    /// Faults that tear down the whole core rather than one message
    /// or one peer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Fault::Crypto(_))
    }
}

impl From<std::io::Error> for Fault {
    fn from(e: std::io::Error) -> Self {
        Fault::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Fault::Crypto("x".into()).kind(), "crypto");
        assert_eq!(Fault::Replay { counter: 3, timestamp: 0 }.kind(), "replay");
        assert_eq!(Fault::Usage("send before init".into()).kind(), "usage");
    }

    #[test]
    fn only_crypto_is_fatal() {
        assert!(Fault::Crypto("kdf".into()).is_fatal());
        assert!(!Fault::Auth("sig".into()).is_fatal());
        assert!(!Fault::Transport("closed".into()).is_fatal());
    }
}
