//! Static descriptors of the container formats the engine can write.

use std::fmt;
use std::path::Path;

/// One writable container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchiveFormat {
    name: &'static str,
    extension: &'static str,
    supports_multiple_entries: bool,
    supports_comment: bool,
}

impl ArchiveFormat {
    pub const ZIP: ArchiveFormat = ArchiveFormat::new("Zip", "zip", true, true);
    pub const GZ: ArchiveFormat = ArchiveFormat::new("Gzip", "gz", false, false);
    pub const BZ2: ArchiveFormat = ArchiveFormat::new("Bzip2", "bz2", false, false);
    pub const TAR: ArchiveFormat = ArchiveFormat::new("Tar", "tar", true, false);
    pub const TAR_GZ: ArchiveFormat = ArchiveFormat::new("Tar/Gzip", "tar.gz", true, false);
    pub const TAR_BZ2: ArchiveFormat = ArchiveFormat::new("Tar/Bzip2", "tar.bz2", true, false);
    pub const ISO: ArchiveFormat = ArchiveFormat::new("ISO", "iso", true, false);

    /// Every known format, in display order.
    pub const ALL: [ArchiveFormat; 7] = [
        ArchiveFormat::ZIP,
        ArchiveFormat::GZ,
        ArchiveFormat::BZ2,
        ArchiveFormat::TAR,
        ArchiveFormat::TAR_GZ,
        ArchiveFormat::TAR_BZ2,
        ArchiveFormat::ISO,
    ];

    const fn new(
        name: &'static str,
        extension: &'static str,
        supports_multiple_entries: bool,
        supports_comment: bool,
    ) -> ArchiveFormat {
        ArchiveFormat {
            name,
            extension,
            supports_multiple_entries,
            supports_comment,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Canonical extension, without the leading dot.
    pub fn extension(&self) -> &'static str {
        self.extension
    }

    pub fn supports_multiple_entries(&self) -> bool {
        self.supports_multiple_entries
    }

    pub fn supports_comment(&self) -> bool {
        self.supports_comment
    }

    /// Format whose canonical extension ends the given file name. The
    /// longest extension wins so `x.tar.gz` is Tar/Gzip, not Gzip.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<ArchiveFormat> {
        let file_name = path.as_ref().file_name()?.to_str()?.to_ascii_lowercase();

        ArchiveFormat::ALL
            .iter()
            .filter(|format| {
                file_name
                    .strip_suffix(format.extension)
                    .map_or(false, |stem| stem.ends_with('.'))
            })
            .max_by_key(|format| format.extension.len())
            .copied()
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Formats able to hold at least the requested number of entries: every
/// format when `many_entries` is false, only the many-entry ones otherwise.
pub fn get_formats(many_entries: bool) -> Vec<ArchiveFormat> {
    ArchiveFormat::ALL
        .iter()
        .filter(|format| !many_entries || format.supports_multiple_entries)
        .copied()
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_many_entry_formats_are_a_strict_subset() {
        let all = get_formats(false);
        let many = get_formats(true);

        assert!(many.len() < all.len());
        assert!(many.iter().all(|f| all.contains(f)));
        assert!(many.iter().all(|f| f.supports_multiple_entries()));
        assert!(!many.contains(&ArchiveFormat::GZ));
        assert!(!many.contains(&ArchiveFormat::BZ2));
    }

    #[test]
    fn test_single_comment_format() {
        let commenting: Vec<_> = get_formats(false)
            .into_iter()
            .filter(|f| f.supports_comment())
            .collect();
        assert_eq!(commenting, vec![ArchiveFormat::ZIP]);
    }

    #[test]
    fn test_from_path_prefers_longest_extension() {
        assert_eq!(ArchiveFormat::from_path("out.tar.gz"), Some(ArchiveFormat::TAR_GZ));
        assert_eq!(ArchiveFormat::from_path("out.GZ"), Some(ArchiveFormat::GZ));
        assert_eq!(ArchiveFormat::from_path("/tmp/a.tar.bz2"), Some(ArchiveFormat::TAR_BZ2));
        assert_eq!(ArchiveFormat::from_path("disk.iso"), Some(ArchiveFormat::ISO));
        assert_eq!(ArchiveFormat::from_path("gz"), None);
        assert_eq!(ArchiveFormat::from_path("notes.txt"), None);
    }
}
