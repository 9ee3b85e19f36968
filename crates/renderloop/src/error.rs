use crate::backend::BackendError;
use crate::uniforms::UniformKind;

/// Errors surfaced directly to the caller that made a bad call.
///
/// Routine failures are not represented here: render routines report
/// `anyhow::Error`s which the dispatcher isolates instead of propagating.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("uniform '{name}' expects {expected} {kind} element(s), got {actual}")]
    InvalidArity {
        name: String,
        kind: UniformKind,
        expected: usize,
        actual: usize,
    },
    #[error("uniform '{name}' is declared as {declared}, requested as {requested}")]
    TypeMismatch {
        name: String,
        declared: UniformKind,
        requested: UniformKind,
    },
    #[error("shader program '{program}' has not been compiled")]
    NotCompiled { program: String },
    #[error("uniform '{name}' is not registered on program '{program}'")]
    UnknownUniform { program: String, name: String },
    #[error("shader program '{program}' no longer accepts queued uniform updates")]
    Disconnected { program: String },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;
