//! Error types and exit codes for meshfw

use meshfw_update::FirmwareUpdateError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Process exit code for a failed command
pub fn exit_code(error: &anyhow::Error) -> i32 {
    if let Some(cli) = error.downcast_ref::<CliError>() {
        return match cli {
            CliError::NotFound(_) => 2,
            CliError::InvalidArgument(_) | CliError::JsonError(_) => 4,
            CliError::IoError(_) => 1,
        };
    }
    match error.downcast_ref::<FirmwareUpdateError>() {
        Some(FirmwareUpdateError::AssetNotFound { .. }) => 2,
        Some(
            FirmwareUpdateError::DownloadFailed(_)
            | FirmwareUpdateError::IncompleteDownload { .. }
            | FirmwareUpdateError::Http(_),
        ) => 3,
        Some(FirmwareUpdateError::Config(_)) => 4,
        Some(FirmwareUpdateError::ExtractionFailed(_) | FirmwareUpdateError::Archive(_)) => 5,
        Some(FirmwareUpdateError::Cancelled) => 130,
        _ => 1,
    }
}
