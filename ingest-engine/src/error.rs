use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failure kinds reported by the primitive dispatcher.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PrimitiveError {
    #[error("pipeline runner unreachable at {endpoint}: {message}")]
    RunnerUnreachable { endpoint: String, message: String },

    #[error("pipeline runner rejected request: {message}")]
    BadRequest { message: String },

    #[error("primitive execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("primitive timed out after {seconds}s during {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("no output exposed by solution {solution_id}")]
    NoOutputExposed { solution_id: String },

    #[error("malformed result uri: {uri}")]
    MalformedResultUri { uri: String },

    #[error("malformed primitive output {path}: {message}")]
    MalformedOutput { path: String, message: String },
}

/// Flat error taxonomy used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Schema,
    Io,
    Csv,
    Primitive,
    Classification,
    Index,
    Database,
    Canceled,
    Timeout,
    Http,
    Config,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Schema error: {message}")]
    Schema { message: String },

    #[error("Missing field '{field}' in {context}")]
    MissingField { field: String, context: String },

    #[error("Expected merged schema in {path}")]
    NotMergedSchema { path: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("CSV error: {message}")]
    Csv { message: String },

    #[error("Primitive error: {0}")]
    Primitive(#[from] PrimitiveError),

    #[error("Classification error: {message}")]
    Classification { message: String },

    #[error("Search index error: {message}")]
    Index { message: String },

    #[error("Dataset {dataset_id} is not merged ({resources} data resources)")]
    NotMerged { dataset_id: String, resources: usize },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Unexpected status {status} from {url}")]
    BadStatus { status: u16, url: String },

    #[error("Operation canceled: {operation}")]
    Canceled { operation: String },

    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("gRPC transport error: {0}")]
    GrpcError(#[from] tonic::transport::Error),

    #[error("gRPC status error: {0}")]
    GrpcStatusError(#[from] tonic::Status),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<IngestError>,
    },
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    pub fn schema(message: impl Into<String>) -> Self {
        IngestError::Schema {
            message: message.into(),
        }
    }

    pub fn csv(message: impl Into<String>) -> Self {
        IngestError::Csv {
            message: message.into(),
        }
    }

    /// Maps an io error on `path` onto the taxonomy, keeping not-found and
    /// permission-denied distinct.
    pub fn io(path: impl AsRef<Path>, err: std::io::Error) -> Self {
        let path = path.as_ref().display().to_string();
        match err.kind() {
            std::io::ErrorKind::NotFound => IngestError::FileNotFound { path },
            std::io::ErrorKind::PermissionDenied => IngestError::PermissionDenied { path },
            _ => IngestError::IoError {
                message: format!("{}: {}", path, err),
            },
        }
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        IngestError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Schema { .. }
            | IngestError::MissingField { .. }
            | IngestError::NotMergedSchema { .. } => ErrorKind::Schema,
            IngestError::FileNotFound { .. }
            | IngestError::PermissionDenied { .. }
            | IngestError::IoError { .. } => ErrorKind::Io,
            IngestError::Csv { .. } => ErrorKind::Csv,
            IngestError::Primitive(PrimitiveError::Timeout { .. }) => ErrorKind::Timeout,
            IngestError::Primitive(_) => ErrorKind::Primitive,
            IngestError::Classification { .. } => ErrorKind::Classification,
            IngestError::Index { .. } | IngestError::NotMerged { .. } => ErrorKind::Index,
            IngestError::Database { .. } => ErrorKind::Database,
            IngestError::Canceled { .. } => ErrorKind::Canceled,
            IngestError::Timeout { .. } => ErrorKind::Timeout,
            IngestError::BadStatus { .. } | IngestError::HttpError(_) => ErrorKind::Http,
            IngestError::JsonError(_) => ErrorKind::Schema,
            IngestError::GrpcError(_) | IngestError::GrpcStatusError(_) => ErrorKind::Primitive,
            IngestError::ConfigError { .. } => ErrorKind::Config,
            IngestError::Context { source, .. } => source.kind(),
        }
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => IngestError::FileNotFound {
                path: err.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => IngestError::PermissionDenied {
                path: err.to_string(),
            },
            _ => IngestError::IoError {
                message: err.to_string(),
            },
        }
    }
}

impl From<csv::Error> for IngestError {
    fn from(err: csv::Error) -> Self {
        let message = err.to_string();
        match err.into_kind() {
            csv::ErrorKind::Io(io) => IngestError::from(io),
            csv::ErrorKind::UnequalLengths {
                pos,
                expected_len,
                len,
            } => IngestError::Csv {
                message: format!(
                    "column count mismatch at line {}: expected {} fields, found {}",
                    pos.map(|p| p.line()).unwrap_or_default(),
                    expected_len,
                    len
                ),
            },
            _ => IngestError::Csv { message },
        }
    }
}

impl From<diesel::result::Error> for IngestError {
    fn from(err: diesel::result::Error) -> Self {
        IngestError::Database {
            message: err.to_string(),
        }
    }
}

impl From<walkdir::Error> for IngestError {
    fn from(err: walkdir::Error) -> Self {
        let path = err
            .path()
            .map(Path::to_path_buf)
            .unwrap_or_else(PathBuf::new);
        match err.into_io_error() {
            Some(io) => IngestError::io(path, io),
            None => IngestError::IoError {
                message: format!("filesystem loop at {}", path.display()),
            },
        }
    }
}
