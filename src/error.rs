//! Error taxonomy.
//!
//! Internal plumbing propagates `anyhow::Error`. The write path converts every
//! failure into a [`WriteError`], whose `Display` text is safe to show to the
//! person at the upload form; the underlying cause is logged instead of being
//! carried in the message.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest could not be read: {path}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest is not valid JSON: {path}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest is not valid UTF-8: {path}")]
    NotUtf8 {
        path: PathBuf,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("manifest could not be written: {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of an upload, update or version activation.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Unknown document type '{0}'. Choose OI or WI.")]
    UnknownDocumentType(String),

    #[error("A machine name is required for WI documents.")]
    MachineNameRequired,

    #[error("Please select a file to upload.")]
    EmptyFile,

    #[error("The file name is not valid.")]
    InvalidFileName,

    #[error("Document not found.")]
    DocumentNotFound,

    #[error("The document type cannot be changed after upload.")]
    DocumentTypeImmutable,

    #[error("The requested version does not exist.")]
    VersionNotFound,

    #[error("The document list could not be read. No changes were made.")]
    ManifestUnreadable,

    #[error("The document folder is not available.")]
    RootUnavailable,

    #[error("The document could not be saved. Please try again.")]
    SaveFailed,
}

impl WriteError {
    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            WriteError::UnknownDocumentType(_)
            | WriteError::MachineNameRequired
            | WriteError::EmptyFile
            | WriteError::InvalidFileName
            | WriteError::DocumentTypeImmutable => "bad_request",
            WriteError::DocumentNotFound | WriteError::VersionNotFound => "not_found",
            WriteError::ManifestUnreadable => "manifest_unreadable",
            WriteError::RootUnavailable => "root_unavailable",
            WriteError::SaveFailed => "save_failed",
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self.code(), "bad_request" | "not_found")
    }
}

impl From<ManifestError> for WriteError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::Unreadable { .. }
            | ManifestError::NotUtf8 { .. }
            | ManifestError::Corrupt { .. } => {
                WriteError::ManifestUnreadable
            }
            ManifestError::Write { .. } => WriteError::SaveFailed,
        }
    }
}
