use thiserror::Error;

/// Result type alias for imprint operations
pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum ImprintError {
    #[error("Administrator credential was rejected")]
    InvalidCredential,

    #[error("No mountpoint appeared on {0} after flashing")]
    MountNotFound(String),

    #[error("Unsupported image variant: {0}")]
    UnsupportedOsVariant(String),

    #[error("Not supported on this platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Download failed: {url} returned HTTP {status}")]
    DownloadFailure { url: String, status: u16 },

    #[error("Refusing to decompress {0}: only .gz archives are handled")]
    DecompressExtensionMismatch(String),

    #[error("Could not read the boot catalog report: {0}")]
    BootCatalogParseFailure(String),

    #[error("{program} exited with status {code:?}")]
    SubprocessNonZeroExit { program: String, code: Option<i32> },

    #[error("Flash job {0} is already running")]
    AlreadyRunning(String),
}
