use std::io;

use thiserror::Error;

use crate::compression::CompressionMethod;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive error {0}")]
    Io(#[from] io::Error),

    #[error("The compression method '{0}' is not supported")]
    UnsupportedCompressionMethod(CompressionMethod),

    #[error("The compression method code '{0}' is not supported")]
    UnsupportedCompressionMethodCode(u16),

    #[error("Bad archive structure : {0}")]
    BadArchiveStructure(String),

    #[error("Wrong file signature was {actual} but should be {expected}")]
    SignatureMismatch { expected: String, actual: String },

    /// The archiver was used out of sequence: after close, or a second entry
    /// on a single entry format.
    #[error("Invalid archiver state : {0}")]
    InvalidState(String),

    #[error("Invalid entry '{path}' : {reason}")]
    InvalidEntry { path: String, reason: String },

    #[error("Invalid configuration : {0}")]
    InvalidConfig(String),

    #[error("Unsupported archive format : {0}")]
    UnsupportedFormat(String),

    #[error("7-Zip error : {0}")]
    SevenZip(String),
}

impl ArchiveError {
    pub(crate) fn bad_structure(detail: impl Into<String>) -> Self {
        ArchiveError::BadArchiveStructure(detail.into())
    }

    pub(crate) fn invalid_entry(path: &str, reason: impl Into<String>) -> Self {
        ArchiveError::InvalidEntry {
            path: path.to_owned(),
            reason: reason.into(),
        }
    }
}

impl From<ArchiveError> for io::Error {
    fn from(value: ArchiveError) -> Self {
        match value {
            ArchiveError::Io(e) => e,
            ArchiveError::InvalidEntry { .. } | ArchiveError::InvalidConfig(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, value)
            }
            ArchiveError::BadArchiveStructure(_) | ArchiveError::SignatureMismatch { .. } => {
                io::Error::new(io::ErrorKind::InvalidData, value)
            }
            ArchiveError::UnsupportedCompressionMethod(_)
            | ArchiveError::UnsupportedCompressionMethodCode(_)
            | ArchiveError::UnsupportedFormat(_) => io::Error::new(io::ErrorKind::Unsupported, value),
            _ => io::Error::new(io::ErrorKind::Other, value),
        }
    }
}

impl From<sevenz_rust::Error> for ArchiveError {
    fn from(value: sevenz_rust::Error) -> Self {
        ArchiveError::SevenZip(value.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signature_message_names_both_sides() {
        let err = ArchiveError::SignatureMismatch {
            expected: "377abcaf271c".to_owned(),
            actual: "504b0304".to_owned(),
        };

        let message = err.to_string();
        assert!(message.contains("377abcaf271c"));
        assert!(message.contains("504b0304"));
    }

    #[test]
    fn io_error_round_trip_keeps_kind() {
        let err = ArchiveError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let back: io::Error = err.into();
        assert_eq!(back.kind(), io::ErrorKind::BrokenPipe);

        let invalid: io::Error = ArchiveError::InvalidConfig("label".to_owned()).into();
        assert_eq!(invalid.kind(), io::ErrorKind::InvalidInput);
    }
}
