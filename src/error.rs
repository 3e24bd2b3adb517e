use thiserror::Error;

use crate::adb::AdbError;

pub type Result<T, E = CliError> = std::result::Result<T, E>;

/// Everything that makes a command exit with status 1.
#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Adb(#[from] AdbError),

    #[error("Only one of -e, -d, or -s can be provided")]
    ConflictingDeviceSelection,

    #[error("Package {0} does not exist")]
    PackageNotFound(String),

    #[error(
        "This command can only be executed on API {required} and above, your device version is {actual}"
    )]
    ApiTooLow { required: u32, actual: u32 },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Failed(String),

    #[error("Not implemented: \"{0}\"")]
    NotImplemented(String),

    #[error("Package inspection task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
