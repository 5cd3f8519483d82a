//! Error types shared by the connector workspace.
//!
//! Every failure in this program is fatal: errors are propagated to `main`,
//! which logs them once and exits with a non-zero status.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type AppResult<T> = Result<T, AppError>;

/// Application error taxonomy.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is unset or empty.
    #[error("Required environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// An optional environment variable holds a value that cannot be used.
    #[error("Invalid value for environment variable {name}: {reason}")]
    InvalidEnv { name: &'static str, reason: String },

    /// The secure dialer could not be constructed.
    #[error("failed to init Dialer: {0}")]
    DialerInit(String),

    /// The composed connection string was rejected by the pool client.
    #[error("failed to parse connection config: {0}")]
    ConfigParse(String),

    /// The connection pool could not be established.
    #[error("failed to connect: {0}")]
    DatabaseConnection(String),

    /// The diagnostic query failed.
    #[error("failed to execute query: {0}")]
    DatabaseQuery(String),

    /// No usable access token could be obtained.
    #[error("credentials error: {0}")]
    Credentials(String),

    /// An AlloyDB Admin API call failed.
    #[error("admin API error: {0}")]
    AdminApi(String),

    /// Opening a tunnel to the instance failed.
    #[error("failed to dial instance: {0}")]
    Dial(String),

    /// TLS material could not be prepared or the handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server refused the connection metadata.
    #[error("metadata exchange failed: {0}")]
    MetadataExchange(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Returns a short, stable code describing the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::MissingEnv(_) | AppError::InvalidEnv { .. } => "CONFIG_ERROR",
            AppError::DialerInit(_) => "DIALER_INIT_ERROR",
            AppError::ConfigParse(_) => "CONFIG_PARSE_ERROR",
            AppError::DatabaseConnection(_) => "DB_CONNECTION_ERROR",
            AppError::DatabaseQuery(_) => "DB_QUERY_ERROR",
            AppError::Credentials(_) => "CREDENTIALS_ERROR",
            AppError::AdminApi(_) => "ADMIN_API_ERROR",
            AppError::Dial(_) => "DIAL_ERROR",
            AppError::Tls(_) => "TLS_ERROR",
            AppError::MetadataExchange(_) => "METADATA_EXCHANGE_ERROR",
            AppError::Io(_) => "IO_ERROR",
        }
    }
}
