//! Error types you might see while driving storlets from the storage side

use thiserror::Error;

/// Errors while reading gateway configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// configuration value could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    /// unknown container engine name
    #[error("unsupported container engine {0:?}")]
    UnsupportedEngine(String),
}

/// Errors reported by a container engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// no such container
    #[error("container {0} is not found")]
    NotFound(String),

    /// no such image
    #[error("image {0} is not found")]
    ImageNotFound(String),

    /// the engine refused or failed a request
    #[error("container engine error: {0}")]
    Api(String),

    /// io error while talking to the engine
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Errors during one storlet invocation or sandbox management step
#[derive(Error, Debug)]
pub enum StorletError {
    /// sandbox or daemon management failed
    #[error("storlet runtime error: {0}")]
    Runtime(String),

    /// a wait on the sandbox exceeded its budget
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// request is missing or carries invalid options
    #[error("invalid storlet request: {0}")]
    InvalidRequest(String),

    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// sbus client error
    #[error("sbus client error: {0}")]
    ClientError(#[from] storlets_protocol::ClientError),

    /// container engine error
    #[error("container engine error: {0}")]
    EngineError(#[from] EngineError),

    /// configuration error
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// blocking task failed
    #[error("task join error: {0}")]
    TaskJoinError(#[from] tokio::task::JoinError),
}

impl StorletError {
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        StorletError::Runtime(message.into())
    }
}

/// Outcome reported to whoever asked for the storlet, without internal detail
#[derive(Error, Debug)]
pub enum GatewayError {
    /// storlet could not be run right now
    #[error("storlet execution is unavailable")]
    ServiceUnavailable,

    /// request could not be understood
    #[error("bad request: {0}")]
    BadRequest(String),
}

/// Registration metadata that does not describe a usable storlet or dependency
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("mandatory parameter is missing: {0}")]
    MissingParameter(String),

    #[error("storlet name is incorrect")]
    InvalidName,

    #[error("unsupported language")]
    UnsupportedLanguage,

    #[error("language version is invalid")]
    InvalidLanguageVersion,

    #[error("unsupported language version")]
    UnsupportedLanguageVersion,

    #[error("main class should be included in storlet file")]
    MainNotInStorlet,

    #[error("submodules are currently not supported")]
    SubmoduleNotSupported,

    #[error("using the same name for storlet and dependency is not allowed")]
    DependencyNamedAsStorlet,

    #[error("duplicated name in dependencies")]
    DuplicatedDependency,

    #[error("dependency permission is incorrect")]
    InvalidPermission,

    #[error("the owner should have rw permission")]
    OwnerNeedsReadWrite,
}
