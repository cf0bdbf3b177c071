//! Error types for the table synchronization library.

use thiserror::Error;

/// Main error type for synchronization operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mapping error: required source value missing, no derivable join key,
    /// response mapping without a key column. Always aborts the job.
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Database statement or protocol error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A bulk-load batch was rejected while skip-failing-rows is disabled
    #[error("Bulk load into {table} failed: {message}")]
    BulkLoad { table: String, message: String },

    /// Merge or excess-deletion failed for a destination table
    #[error("Merge failed for table {table} (columns: {columns}): {message}")]
    Merge {
        table: String,
        columns: String,
        message: String,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job was cancelled (SIGINT, etc.)
    #[error("Job cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        SyncError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Merge error carrying the destination table and column list
    pub fn merge(
        table: impl Into<String>,
        columns: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        SyncError::Merge {
            table: table.into(),
            columns: columns.into(),
            message: message.to_string(),
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Process exit code for this error, used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::Yaml(_) | SyncError::Json(_) => 1,
            SyncError::Mapping(_) => 2,
            SyncError::Db(_) => 3,
            SyncError::Pool { .. } => 4,
            SyncError::BulkLoad { .. } => 5,
            SyncError::Merge { .. } => 6,
            SyncError::Io(_) => 7,
            SyncError::Cancelled => 130,
        }
    }

    /// Whether the underlying database error is a unique-constraint violation.
    ///
    /// Used to append the duplicate-key hint to the job log when a merge
    /// fails: such errors usually indicate duplicates in a column used as a
    /// key or identity.
    pub fn is_unique_violation(&self) -> bool {
        if let SyncError::Db(e) = self {
            return e
                .code()
                .map(|c| c == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
                .unwrap_or(false);
        }
        false
    }
}

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;
