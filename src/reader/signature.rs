//! Leading magic byte checks.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{ArchiveSource, RandomAccess};
use crate::error::{ArchiveError, Result};

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Checks that `reader` starts with `expected` and rewinds it.
pub fn verify<R: Read + Seek + ?Sized>(reader: &mut R, expected: &[u8]) -> Result<()> {
    reader.seek(SeekFrom::Start(0))?;
    let mut actual = Vec::with_capacity(expected.len());
    (&mut *reader)
        .take(expected.len() as u64)
        .read_to_end(&mut actual)?;
    reader.seek(SeekFrom::Start(0))?;

    if actual != expected {
        return Err(ArchiveError::SignatureMismatch {
            expected: hex(expected),
            actual: hex(&actual),
        });
    }
    Ok(())
}

/// A source whose handles are checked against a signature when opened.
pub struct SignatureCheckedSource {
    inner: Arc<dyn ArchiveSource>,
    signature: &'static [u8],
}

impl SignatureCheckedSource {
    pub fn new(inner: Arc<dyn ArchiveSource>, signature: &'static [u8]) -> SignatureCheckedSource {
        SignatureCheckedSource { inner, signature }
    }
}

impl ArchiveSource for SignatureCheckedSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn len(&self) -> io::Result<u64> {
        self.inner.len()
    }

    fn open_random(&self) -> io::Result<Box<dyn RandomAccess>> {
        let mut handle = self.inner.open_random()?;
        verify(handle.as_mut(), self.signature)?;
        Ok(handle)
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.inner.last_modified()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reader::MemorySource;

    #[test]
    fn test_mismatch_reports_both_sides() {
        let mut cursor = io::Cursor::new(b"PK\x03\x04rest".to_vec());
        let err = verify(&mut cursor, b"7z\xbc\xaf\x27\x1c").unwrap_err();
        match err {
            ArchiveError::SignatureMismatch { expected, actual } => {
                assert_eq!(expected, "377abcaf271c");
                assert_eq!(actual, "504b03047265");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_short_source_is_a_mismatch() {
        let mut cursor = io::Cursor::new(b"7z".to_vec());
        assert!(verify(&mut cursor, b"7z\xbc\xaf\x27\x1c").is_err());
    }

    #[test]
    fn test_checked_source_rewinds() {
        let inner = Arc::new(MemorySource::new("a.7z", b"MAGICdata".to_vec()));
        let source = SignatureCheckedSource::new(inner, b"MAGIC");
        let mut handle = source.open_random().unwrap();
        let mut content = String::new();
        handle.read_to_string(&mut content).unwrap();
        assert_eq!(content, "MAGICdata");

        let wrong = SignatureCheckedSource::new(
            Arc::new(MemorySource::new("b.7z", b"other".to_vec())),
            b"MAGIC",
        );
        let err = wrong.open_random().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
