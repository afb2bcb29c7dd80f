use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("backlog: {0}")]
    Backlog(#[from] backlog_wire::BacklogError),
    #[error("not attached")]
    NotAttached,
    #[error("unknown thread {0}")]
    UnknownThread(i64),
    #[error("unknown variablesReference {0}")]
    UnknownVariablesReference(i64),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
