use thiserror::Error;

/// Failures raised by the host-provided script helpers. These surface to
/// scripts as Lua runtime errors carrying the display text.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BindingError {
    #[error("entity {0} was not found or is being destroyed")]
    EntityNotFound(u64),
    #[error("unknown component {0}")]
    UnknownComponent(String),
    #[error("component {0} is not networked")]
    NotNetworked(String),
    #[error("unknown event type {0}")]
    UnknownEvent(String),
    #[error("event {0} is not wired into the simulation")]
    EventNotWired(String),
    #[error("Invalid vector")]
    InvalidVector,
    #[error("world is not available outside of a simulation step")]
    WorldUnavailable,
}

impl From<BindingError> for mlua::Error {
    fn from(err: BindingError) -> Self {
        mlua::Error::RuntimeError(err.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame ended unexpectedly")]
    UnexpectedEof,
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("length prefix overflows")]
    LengthOverflow,
    #[error("string field of {0} bytes exceeds the frame limit")]
    StringTooLong(usize),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Console commands refused before anything reaches the server.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("You do not have lua scripting permission.")]
    NoPermission,
    #[error("Usage: {0} [envname]")]
    Usage(String),
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("console {0} is not open")]
    UnknownConsole(u64),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown permission flag '{flag}' for user {user}")]
    UnknownFlag { user: String, flag: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_errors_become_runtime_errors_with_readable_text() {
        let err: mlua::Error = BindingError::UnknownComponent("Jetpack".to_string()).into();
        match err {
            mlua::Error::RuntimeError(msg) => assert_eq!(msg, "unknown component Jetpack"),
            other => panic!("unexpected error kind: {other:?}"),
        }
    }
}
