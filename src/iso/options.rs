use crate::error::{ArchiveError, Result};
use crate::types::ContentSource;

use super::names::d_characters;

/// Longest primary volume label, in d-characters.
pub const MAX_VOLUME_ID_LEN: usize = 32;
/// Longest Joliet volume label, in UCS-2 characters.
pub const MAX_JOLIET_VOLUME_ID_LEN: usize = 16;
/// Longest publisher, preparer, system or application identifier.
pub const MAX_IDENTIFIER_LEN: usize = 128;
const MAX_SYSTEM_ID_LEN: usize = 32;

pub const DEFAULT_VOLUME_ID: &str = "CDROM";

/// Bootable image settings. Only the no-emulation mode is written.
#[derive(Debug, Clone)]
pub struct ElToritoOptions {
    pub boot_image: ContentSource,
    /// Virtual 512 byte sectors loaded by the BIOS.
    pub load_sectors: u16,
    /// 0 is x86, 0xEF is EFI.
    pub platform_id: u8,
    pub id_string: String,
}

impl ElToritoOptions {
    pub fn new(boot_image: ContentSource) -> ElToritoOptions {
        ElToritoOptions {
            boot_image,
            load_sectors: 4,
            platform_id: 0,
            id_string: String::new(),
        }
    }

    pub fn load_sectors(mut self, load_sectors: u16) -> ElToritoOptions {
        self.load_sectors = load_sectors;
        self
    }

    pub fn platform_id(mut self, platform_id: u8) -> ElToritoOptions {
        self.platform_id = platform_id;
        self
    }

    pub fn id_string(mut self, id_string: &str) -> ElToritoOptions {
        self.id_string = id_string.to_owned();
        self
    }
}

/// ISO9660 image settings.
///
/// ```
/// use arcengine::iso::IsoOptions;
///
/// let options = IsoOptions::default()
///     .volume_id("BACKUP_2024")
///     .publisher("someone")
///     .rock_ridge(false);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct IsoOptions {
    pub volume_id: Option<String>,
    pub publisher: Option<String>,
    pub data_preparer: Option<String>,
    pub system_id: Option<String>,
    pub application_id: Option<String>,
    /// UCS-2 names up to 64 characters in a supplementary hierarchy.
    pub joliet: bool,
    /// POSIX attributes, long names and unrestricted depth.
    pub rock_ridge: bool,
    pub el_torito: Option<ElToritoOptions>,
}

impl Default for IsoOptions {
    fn default() -> Self {
        IsoOptions {
            volume_id: None,
            publisher: None,
            data_preparer: None,
            system_id: None,
            application_id: None,
            joliet: true,
            rock_ridge: true,
            el_torito: None,
        }
    }
}

impl IsoOptions {
    pub fn volume_id(mut self, volume_id: &str) -> IsoOptions {
        self.volume_id = Some(volume_id.to_owned());
        self
    }

    pub fn publisher(mut self, publisher: &str) -> IsoOptions {
        self.publisher = Some(publisher.to_owned());
        self
    }

    pub fn data_preparer(mut self, data_preparer: &str) -> IsoOptions {
        self.data_preparer = Some(data_preparer.to_owned());
        self
    }

    pub fn system_id(mut self, system_id: &str) -> IsoOptions {
        self.system_id = Some(system_id.to_owned());
        self
    }

    pub fn application_id(mut self, application_id: &str) -> IsoOptions {
        self.application_id = Some(application_id.to_owned());
        self
    }

    pub fn joliet(mut self, joliet: bool) -> IsoOptions {
        self.joliet = joliet;
        self
    }

    pub fn rock_ridge(mut self, rock_ridge: bool) -> IsoOptions {
        self.rock_ridge = rock_ridge;
        self
    }

    pub fn el_torito(mut self, el_torito: ElToritoOptions) -> IsoOptions {
        self.el_torito = Some(el_torito);
        self
    }

    /// Primary volume label in d-characters.
    pub fn primary_volume_id(&self) -> String {
        d_characters(self.volume_id.as_deref().unwrap_or(DEFAULT_VOLUME_ID))
    }

    /// Joliet volume label, the first 16 characters of the volume id.
    pub fn joliet_volume_id(&self) -> String {
        self.volume_id
            .as_deref()
            .unwrap_or(DEFAULT_VOLUME_ID)
            .chars()
            .take(MAX_JOLIET_VOLUME_ID_LEN)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let volume_id = self.primary_volume_id();
        if volume_id.is_empty() {
            return Err(ArchiveError::InvalidConfig("empty volume id".to_owned()));
        }
        if volume_id.chars().count() > MAX_VOLUME_ID_LEN {
            return Err(ArchiveError::InvalidConfig(format!(
                "volume id '{volume_id}' is longer than {MAX_VOLUME_ID_LEN} characters"
            )));
        }

        let identifiers = [
            ("publisher", &self.publisher, MAX_IDENTIFIER_LEN),
            ("data preparer", &self.data_preparer, MAX_IDENTIFIER_LEN),
            ("application id", &self.application_id, MAX_IDENTIFIER_LEN),
            ("system id", &self.system_id, MAX_SYSTEM_ID_LEN),
        ];
        for (label, value, max) in identifiers {
            if let Some(value) = value {
                if value.chars().count() > max {
                    return Err(ArchiveError::InvalidConfig(format!(
                        "{label} is longer than {max} characters"
                    )));
                }
            }
        }

        if let Some(el_torito) = &self.el_torito {
            if el_torito.load_sectors == 0 {
                return Err(ArchiveError::InvalidConfig(
                    "boot image must load at least one sector".to_owned(),
                ));
            }
            if el_torito.id_string.len() > 24 {
                return Err(ArchiveError::InvalidConfig(
                    "boot catalog id is longer than 24 bytes".to_owned(),
                ));
            }
            el_torito.boot_image.len().map_err(|e| {
                ArchiveError::InvalidConfig(format!("boot image length unavailable: {e}"))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_volume_labels() {
        let options = IsoOptions::default().volume_id("my backup, part one");
        assert_eq!(options.primary_volume_id(), "MY_BACKUP__PART_ONE");
        assert_eq!(options.joliet_volume_id(), "my backup, part ");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_long_volume_id_is_rejected() {
        let options = IsoOptions::default().volume_id(&"V".repeat(33));
        assert!(matches!(
            options.validate(),
            Err(ArchiveError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_long_publisher_is_rejected() {
        let options = IsoOptions::default().publisher(&"p".repeat(129));
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_boot_image_must_load_something() {
        let boot = ElToritoOptions::new(ContentSource::from(vec![0u8; 2048])).load_sectors(0);
        assert!(IsoOptions::default().el_torito(boot).validate().is_err());
    }
}
