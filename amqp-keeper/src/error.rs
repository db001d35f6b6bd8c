use std::fmt;

/// Category of a [`ClientError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The broker cannot be reached.
    Unavailable,
    /// There is no open channel on the connection.
    ChannelUnavailable,
    /// Declaring a queue, an exchange or a binding failed.
    DeclareFailure,
    /// The broker or the transport rejected a publish.
    PublishFailure,
    /// The delivery stream of a consumer couldn't be opened.
    ConsumeInitFailure,
    /// The consumer already runs its delivery loop.
    ConsumerRunning,
}

/// Error returned by the client API. It travels inside an `anyhow::Error`, so callers can get
/// it back with `downcast_ref::<ClientError>()`.
#[derive(Clone, Debug)]
pub struct ClientError {
    pub kind: ErrorKind,
    /// Broker address (`host:port`) the operation was addressed to.
    pub addr: String,
    pub message: String,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientError")
            .field("kind", &self.kind)
            .field("addr", &self.addr)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for ClientError {}

impl ClientError {
    pub fn new(kind: ErrorKind, addr: &str, message: impl Into<String>) -> Self {
        ClientError {
            kind,
            addr: addr.to_owned(),
            message: message.into(),
        }
    }
}

/// Returns the kind of the error if it is a [`ClientError`].
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<ClientError>().map(|e| e.kind)
}

/// Shorthand for creating errors in async functions.
#[macro_export]
macro_rules! client_error {
    ($kind:expr, $addr:expr, $message:expr) => {
        ::std::result::Result::Err(anyhow::Error::new($crate::error::ClientError::new(
            $kind, $addr, $message,
        )))
    };
}
