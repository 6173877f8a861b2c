/* src/error.rs */

use thiserror::Error;

/// Failures reported by a [`Storage`](crate::storage::Storage) backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Everything that can go wrong while turning stored rows into an answer.
///
/// `MalformedRecord` and `UnhandledRecordType` only ever describe a single
/// record; the materializer logs and drops them. The lookup variants abort
/// whatever operation raised them.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("zone lookup failed for {zone}: {source}")]
    ZoneLookup {
        zone: String,
        #[source]
        source: StorageError,
    },

    #[error("recordset lookup failed for {name} {rtype}: {source}")]
    RecordSetLookup {
        name: String,
        rtype: String,
        #[source]
        source: StorageError,
    },

    #[error("malformed {rtype} record {id}: {reason}")]
    MalformedRecord {
        id: String,
        rtype: String,
        reason: String,
    },

    #[error("unhandled record type {rtype} for record {id}")]
    UnhandledRecordType { id: String, rtype: String },

    #[error("{owner} {rtype} cannot be put on the wire: {reason}")]
    Unencodable {
        owner: String,
        rtype: String,
        reason: String,
    },
}

impl ResolveError {
    /// True when the store itself failed, as opposed to a row simply missing.
    pub fn is_store_failure(&self) -> bool {
        match self {
            ResolveError::ZoneLookup { source, .. }
            | ResolveError::RecordSetLookup { source, .. } => !source.is_not_found(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum TsigError {
    #[error("tsig secret must be `name:base64secret`")]
    BadFormat,

    #[error("invalid tsig key name: {0}")]
    BadName(String),

    #[error("tsig secret is not valid base64: {0}")]
    BadSecret(#[from] base64::DecodeError),

    #[error("tsig verification failed: {0}")]
    Verify(String),

    #[error("tsig signing failed: {0}")]
    Sign(String),
}
