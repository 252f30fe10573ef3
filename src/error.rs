use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("program script parsing: {0}")]
    Script(#[from] toml::de::Error),
    #[error("invalid program script: {0}")]
    InvalidScript(String),
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    // --------------------------------- remoting errors -------------------------------------------
    #[error("register remoting channel: {0}")]
    ChannelRegistration(std::io::Error),
    #[error("invalid bootstrap handshake: {0}")]
    Handshake(String),
    #[error("invalid controller reference: {0}")]
    ObjRef(String),
    #[error("remote peer disconnected")]
    Disconnected,
    #[error("remoting protocol violation: {0}")]
    Protocol(String),
    #[error("remote fault: {0}")]
    Remote(String),

    // --------------------------------- supervisor errors -----------------------------------------
    #[error("debugger server executable not found: {0}")]
    ServerNotFound(String),
    #[error("could not create the debugger process in {0:?}")]
    LaunchTimeout(Duration),
    #[error("debugger process died unexpectedly")]
    ProcessDiedUnexpectedly,
    #[error("debugger server is not running")]
    ServerNotRunning,

    // --------------------------------- session errors --------------------------------------------
    #[error("operation `{op}` is not allowed in state `{state}`")]
    InvalidState { op: &'static str, state: String },
    #[error("break events can't be changed while the process is running")]
    ChangeNotAllowed,
    #[error("break event {0} not found")]
    BreakEventNotFound(u32),
    #[error("thread {0} not found")]
    ThreadNotFound(i64),
    #[error("frame number {0} not found")]
    FrameNotFound(usize),
    #[error("backtrace is no longer valid, target was resumed")]
    BacktraceInvalidated,
    #[error("backtrace {0} not found")]
    BacktraceNotFound(u64),

    // --------------------------------- evaluation errors -----------------------------------------
    #[error("expression parsing: {0}")]
    ExpressionParsing(String),
    #[error("the name `{0}` does not exist in the current context")]
    UnknownIdentifier(String),
    #[error("type `{type_name}` has no member `{member}`")]
    MemberNotFound { type_name: String, member: String },
    #[error("method `{method}` not found in type `{type_name}`")]
    MethodNotFound { method: String, type_name: String },
    #[error("invalid arguments for method `{method}`: {reason}")]
    InvalidArguments { method: String, reason: String },
    #[error("{0}")]
    EvaluationException(String),
    #[error("{0}")]
    Evaluation(String),
    #[error("can't cast an object of type `{from}` to type `{to}`")]
    CastFailure { from: String, to: String },
    #[error("target invocation is disabled by evaluation options")]
    InvokeNotAllowed,
    #[error("evaluation timed out")]
    EvaluationTimeout,
    #[error("invocation aborted")]
    InvocationAborted,
    #[error("`{0}` is read only")]
    ReadOnly(String),
    #[error("index {index} is out of range, length is {len}")]
    IndexOutOfRange { index: i64, len: usize },
}

impl Error {
    /// Return a hint to a front end - continue the session after error or tear it down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::Json(_) => false,
            Error::Script(_) => false,
            Error::InvalidScript(_) => false,
            Error::NotSupported(_) => false,
            Error::Protocol(_) => false,
            Error::Remote(_) => false,
            Error::ServerNotRunning => false,
            Error::InvalidState { .. } => false,
            Error::ChangeNotAllowed => false,
            Error::BreakEventNotFound(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::FrameNotFound(_) => false,
            Error::BacktraceInvalidated => false,
            Error::BacktraceNotFound(_) => false,
            Error::ExpressionParsing(_) => false,
            Error::UnknownIdentifier(_) => false,
            Error::MemberNotFound { .. } => false,
            Error::MethodNotFound { .. } => false,
            Error::InvalidArguments { .. } => false,
            Error::EvaluationException(_) => false,
            Error::Evaluation(_) => false,
            Error::CastFailure { .. } => false,
            Error::InvokeNotAllowed => false,
            Error::EvaluationTimeout => false,
            Error::InvocationAborted => false,
            Error::ReadOnly(_) => false,
            Error::IndexOutOfRange { .. } => false,

            // startup and transport failures
            Error::ChannelRegistration(_) => true,
            Error::Handshake(_) => true,
            Error::ObjRef(_) => true,
            Error::Disconnected => true,
            Error::ServerNotFound(_) => true,
            Error::LaunchTimeout(_) => true,
            Error::ProcessDiedUnexpectedly => true,
        }
    }
}

/// Kind of failure that keeps its identity when sent over the remoting channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCode {
    ChangeNotAllowed,
    BacktraceInvalidated,
    EvaluationException,
    EvaluationTimeout,
    InvocationAborted,
    InvokeNotAllowed,
    NotSupported,
    Other,
}

/// Error representation on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub code: FaultCode,
    pub message: String,
}

impl From<&Error> for RemoteFault {
    fn from(err: &Error) -> Self {
        let code = match err {
            Error::ChangeNotAllowed => FaultCode::ChangeNotAllowed,
            Error::BacktraceInvalidated => FaultCode::BacktraceInvalidated,
            Error::EvaluationException(_) => FaultCode::EvaluationException,
            Error::EvaluationTimeout => FaultCode::EvaluationTimeout,
            Error::InvocationAborted => FaultCode::InvocationAborted,
            Error::InvokeNotAllowed => FaultCode::InvokeNotAllowed,
            Error::NotSupported(_) => FaultCode::NotSupported,
            _ => FaultCode::Other,
        };
        RemoteFault {
            code,
            message: err.to_string(),
        }
    }
}

impl From<RemoteFault> for Error {
    fn from(fault: RemoteFault) -> Self {
        match fault.code {
            FaultCode::ChangeNotAllowed => Error::ChangeNotAllowed,
            FaultCode::BacktraceInvalidated => Error::BacktraceInvalidated,
            FaultCode::EvaluationException => Error::EvaluationException(fault.message),
            FaultCode::EvaluationTimeout => Error::EvaluationTimeout,
            FaultCode::InvocationAborted => Error::InvocationAborted,
            FaultCode::InvokeNotAllowed => Error::InvokeNotAllowed,
            FaultCode::NotSupported | FaultCode::Other => Error::Remote(fault.message),
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "rdbg", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "rdbg", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(::log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(::log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(::log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(::log::debug, $res, $msg)
    };
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fault_keeps_identity() {
        let fault = RemoteFault::from(&Error::ChangeNotAllowed);
        assert_eq!(fault.code, FaultCode::ChangeNotAllowed);
        assert!(matches!(Error::from(fault), Error::ChangeNotAllowed));

        let fault = RemoteFault::from(&Error::EvaluationException("boom".to_string()));
        match Error::from(fault) {
            Error::EvaluationException(msg) => assert_eq!(msg, "boom"),
            e => panic!("unexpected error {e}"),
        }

        let fault = RemoteFault::from(&Error::FrameNotFound(3));
        match Error::from(fault) {
            Error::Remote(msg) => assert_eq!(msg, "frame number 3 not found"),
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::LaunchTimeout(Duration::from_secs(15)).is_fatal());
        assert!(!Error::ChangeNotAllowed.is_fatal());
        assert!(!Error::CastFailure {
            from: "Derived".to_string(),
            to: "Other".to_string()
        }
        .is_fatal());
    }
}
