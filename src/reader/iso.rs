//! ISO9660 image reader, also used for Nero `.nrg` images.
//!
//! The sector geometry is probed first: cooked 2048 byte sectors or raw
//! 2352/2336 byte ones, starting at offset 0 or after the 150 sector
//! pregap Nero images carry. Names come from Rock Ridge when the primary
//! hierarchy has it, otherwise from the Joliet hierarchy, otherwise from
//! the level 1 identifiers.

use std::collections::HashSet;
use std::io::{self, Read, SeekFrom};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::{
    read_at, reuse_or_open, shared, with_handle, ArchiveEntryIterator, ArchiveReader,
    ArchiveSource, RandomAccess, RecordIterator, SharedSource,
};
use crate::descriptor::ArchiveDescriptorReader;
use crate::error::{ArchiveError, Result};
use crate::iso::names::{decode_ucs2_be, strip_version};
use crate::iso::records::{
    parse_record_date, ParsedRecord, FLAG_MULTI_EXTENT, ROOT_RECORD_LEN, SECTOR_SIZE,
    STANDARD_ID, SYSTEM_AREA_SECTORS, VD_PRIMARY, VD_SUPPLEMENTARY, VD_TERMINATOR,
};
use crate::types::ArchiveEntryRecord;

pub fn factory(source: Arc<dyn ArchiveSource>) -> Result<Box<dyn ArchiveReader>> {
    Ok(Box::new(IsoReader::new(source)))
}

/// Sectors before the first one of a Nero image track.
const NERO_PREGAP_SECTORS: u64 = 150;
const ROOT_RECORD_OFFSET: usize = 156;
const ESCAPE_SEQUENCES_OFFSET: usize = 88;
const JOLIET_LEVELS: [&[u8]; 3] = [b"%/@", b"%/C", b"%/E"];
/// Volume descriptors read before giving up on finding a terminator.
const MAX_VOLUME_DESCRIPTORS: u32 = 64;
/// Continuation areas followed for one record.
const MAX_CONTINUATIONS: usize = 16;

const SUSP_HEADER_LEN: usize = 4;
const NM_CURRENT: u8 = 0x02;
const NM_PARENT: u8 = 0x04;
const TF_CREATION: u8 = 0x01;
const TF_MODIFY: u8 = 0x02;
const TF_LONG_FORM: u8 = 0x80;

/// Physical layout of the sectors holding the 2048 bytes of user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u64,
    /// Header bytes before the user data of a sector.
    pub data_offset: u64,
    /// Byte offset of sector 0.
    pub base: u64,
}

impl Geometry {
    pub fn physical(&self, lba: u64) -> u64 {
        self.base + lba * self.sector_size + self.data_offset
    }

    fn candidates() -> impl Iterator<Item = Geometry> {
        // mode 1 raw, mode 2 form 1 raw, mode 2 without sync
        let layouts = [(2048, 0), (2352, 16), (2352, 24), (2336, 8)];
        layouts.into_iter().flat_map(|(sector_size, data_offset)| {
            [0, NERO_PREGAP_SECTORS * sector_size]
                .into_iter()
                .map(move |base| Geometry {
                    sector_size,
                    data_offset,
                    base,
                })
        })
    }

    /// The first candidate with a volume descriptor where the first one
    /// should be.
    pub fn probe(handle: &mut dyn RandomAccess) -> Result<Geometry> {
        let mut magic = [0u8; 6];
        for geometry in Geometry::candidates() {
            let offset = geometry.physical(SYSTEM_AREA_SECTORS as u64);
            handle.seek(SeekFrom::Start(offset))?;
            if handle.read_exact(&mut magic).is_ok() && &magic[1..] == STANDARD_ID {
                trace!(?geometry, "iso geometry found");
                return Ok(geometry);
            }
        }
        Err(ArchiveError::bad_structure(
            "no ISO9660 volume descriptor found",
        ))
    }
}

/// Reads `len` bytes of user data starting at sector `lba`. Ranges past the
/// end of the image are refused before anything is allocated.
fn read_logical(
    handle: &mut dyn RandomAccess,
    geometry: Geometry,
    lba: u32,
    len: usize,
) -> Result<Vec<u8>> {
    let image_len = handle.seek(SeekFrom::End(0))?;
    if let Some(last) = (len as u64).checked_sub(1) {
        let sector = SECTOR_SIZE as u64;
        let end = geometry.physical(lba as u64 + last / sector) + last % sector + 1;
        if end > image_len {
            return Err(ArchiveError::bad_structure(format!(
                "{len} bytes at sector {lba} run past the end of the image"
            )));
        }
    }

    let mut data = vec![0u8; len];
    if geometry.sector_size == SECTOR_SIZE as u64 {
        handle.seek(SeekFrom::Start(geometry.physical(lba as u64)))?;
        handle.read_exact(&mut data)?;
        return Ok(data);
    }
    for (index, chunk) in data.chunks_mut(SECTOR_SIZE).enumerate() {
        handle.seek(SeekFrom::Start(geometry.physical(lba as u64 + index as u64)))?;
        handle.read_exact(chunk)?;
    }
    Ok(data)
}

/// Where an entry's bytes live: one extent, or several for multi-extent
/// files.
#[derive(Debug, Clone)]
pub struct IsoHandle {
    pub extents: Vec<(u32, u64)>,
    pub geometry: Geometry,
}

/// Which directory tree names come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Naming {
    RockRidge {
        /// Bytes skipped at the start of every system use area.
        skip: usize,
    },
    Joliet,
    Primary,
}

/// Names and dates Rock Ridge attaches to a record.
#[derive(Debug, Default)]
struct RockRidgeFields {
    name: Option<String>,
    modified: Option<DateTime<Utc>>,
    relocated: bool,
}

/// Timestamp of the TF entry, in short (7 byte) or long (17 byte) form.
fn parse_tf(entry: &[u8]) -> Option<DateTime<Utc>> {
    let flags = *entry.get(SUSP_HEADER_LEN)?;
    if flags & TF_MODIFY == 0 {
        return None;
    }
    let width = if flags & TF_LONG_FORM != 0 { 17 } else { 7 };
    let mut start = SUSP_HEADER_LEN + 1;
    if flags & TF_CREATION != 0 {
        start += width;
    }
    let stamp = entry.get(start..start + width)?;
    if width == 7 {
        return parse_record_date(stamp);
    }
    let text = std::str::from_utf8(&stamp[..14]).ok()?;
    let naive = chrono::NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M%S").ok()?;
    let offset = chrono::FixedOffset::east_opt(stamp[16] as i8 as i32 * 15 * 60)?;
    naive
        .and_local_timezone(offset)
        .single()
        .map(|datetime| datetime.with_timezone(&Utc))
}

struct ImageWalker<'a> {
    handle: &'a mut dyn RandomAccess,
    geometry: Geometry,
    naming: Naming,
    visited: HashSet<u32>,
    records: Vec<ArchiveEntryRecord>,
}

impl ImageWalker<'_> {
    fn read(&mut self, lba: u32, len: usize) -> Result<Vec<u8>> {
        read_logical(self.handle, self.geometry, lba, len)
    }

    /// Records of a directory extent, "." and ".." included. A zero length
    /// byte pads to the next sector.
    fn directory_records(&mut self, lba: u32, len: u32) -> Result<Vec<ParsedRecord>> {
        let data = self.read(lba, len as usize)?;
        let mut records = Vec::new();
        let mut position = 0;
        while position < data.len() {
            if data[position] == 0 {
                position = (position / SECTOR_SIZE + 1) * SECTOR_SIZE;
                continue;
            }
            let record = ParsedRecord::parse(&data[position..])?;
            position += data[position] as usize;
            records.push(record);
        }
        Ok(records)
    }

    /// SUSP entries of one system use area, following CE continuations.
    fn rock_ridge(&mut self, system_use: &[u8], skip: usize) -> Result<RockRidgeFields> {
        let mut fields = RockRidgeFields::default();
        let mut name = Vec::new();
        let mut has_name = false;
        let mut area = system_use.get(skip..).unwrap_or_default().to_vec();

        for _ in 0..MAX_CONTINUATIONS {
            let mut continuation = None;
            let mut position = 0;
            while position + SUSP_HEADER_LEN <= area.len() {
                let len = area[position + 2] as usize;
                if len < SUSP_HEADER_LEN || position + len > area.len() {
                    break;
                }
                let entry = &area[position..position + len];
                match &entry[..2] {
                    b"NM" if len > SUSP_HEADER_LEN => {
                        let flags = entry[SUSP_HEADER_LEN];
                        if flags & (NM_CURRENT | NM_PARENT) == 0 {
                            name.extend_from_slice(&entry[SUSP_HEADER_LEN + 1..]);
                            has_name = true;
                        }
                    }
                    b"TF" => fields.modified = fields.modified.or(parse_tf(entry)),
                    b"RE" => fields.relocated = true,
                    b"CE" => {
                        let mut reader = ArchiveDescriptorReader::at(SUSP_HEADER_LEN);
                        let block = reader.read_u32_both(entry)?;
                        let offset = reader.read_u32_both(entry)? as usize;
                        let len = reader.read_u32_both(entry)? as usize;
                        continuation = Some((block, offset, len));
                    }
                    b"ST" => break,
                    _ => {}
                }
                position += len;
            }

            let Some((block, offset, len)) = continuation else {
                break;
            };
            // a continuation area lives inside one sector
            if offset + len > SECTOR_SIZE {
                return Err(ArchiveError::bad_structure(format!(
                    "continuation area of {len} bytes at offset {offset} leaves its sector"
                )));
            }
            let data = self.read(block, offset + len)?;
            area = data[offset..].to_vec();
        }

        if has_name {
            fields.name = Some(String::from_utf8_lossy(&name).into_owned());
        }
        Ok(fields)
    }

    fn name_of(&mut self, record: &ParsedRecord) -> Result<(String, Option<DateTime<Utc>>, bool)> {
        match self.naming {
            Naming::RockRidge { skip } => {
                let fields = self.rock_ridge(&record.system_use, skip)?;
                let name = match fields.name {
                    Some(name) => name,
                    None => strip_version(&String::from_utf8_lossy(&record.identifier)).to_owned(),
                };
                Ok((name, fields.modified.or(record.recorded), fields.relocated))
            }
            Naming::Joliet => {
                let name = decode_ucs2_be(&record.identifier);
                Ok((strip_version(&name).to_owned(), record.recorded, false))
            }
            Naming::Primary => {
                let name = String::from_utf8_lossy(&record.identifier).into_owned();
                Ok((strip_version(&name).to_owned(), record.recorded, false))
            }
        }
    }

    /// Depth first, each directory listed before its content.
    fn walk(&mut self, lba: u32, len: u32, prefix: &str) -> Result<()> {
        if !self.visited.insert(lba) {
            warn!(lba, "directory loop in iso image");
            return Ok(());
        }

        let records = self.directory_records(lba, len)?;
        let mut pending: Option<(ParsedRecord, Vec<(u32, u64)>)> = None;

        for record in records {
            if record.is_self_or_parent() {
                continue;
            }
            // pieces of a multi-extent file share the name of the last one
            let extent = (record.extent, record.data_length as u64);
            let extents = match pending.take() {
                Some((first, mut extents)) if first.identifier == record.identifier => {
                    extents.push(extent);
                    extents
                }
                Some(_) => {
                    return Err(ArchiveError::bad_structure(
                        "multi-extent file interrupted by another record",
                    ))
                }
                None => vec![extent],
            };
            if record.flags & FLAG_MULTI_EXTENT != 0 {
                pending = Some((record, extents));
                continue;
            }

            let (name, modified, relocated) = self.name_of(&record)?;
            if relocated || name.is_empty() || name == "." || name == ".." {
                continue;
            }
            let name = name.replace('/', "_");
            let is_directory = record.is_directory();
            let path = if is_directory {
                format!("{prefix}{name}/")
            } else {
                format!("{prefix}{name}")
            };

            let mut entry = ArchiveEntryRecord::new(path.clone(), is_directory);
            entry.last_modified = modified;
            if !is_directory {
                entry.size = Some(extents.iter().map(|(_, len)| len).sum());
            }
            let geometry = self.geometry;
            self.records.push(entry.with_handle(IsoHandle {
                extents,
                geometry,
            }));

            if is_directory {
                self.walk(record.extent, record.data_length, &path)?;
            }
        }

        if pending.is_some() {
            return Err(ArchiveError::bad_structure(
                "multi-extent file without a final extent",
            ));
        }
        Ok(())
    }
}

/// Roots of the hierarchies found in the volume descriptors.
struct Volume {
    primary: Option<ParsedRecord>,
    joliet: Option<ParsedRecord>,
}

fn read_volume(handle: &mut dyn RandomAccess, geometry: Geometry) -> Result<Volume> {
    let mut volume = Volume {
        primary: None,
        joliet: None,
    };

    for lba in SYSTEM_AREA_SECTORS..SYSTEM_AREA_SECTORS + MAX_VOLUME_DESCRIPTORS {
        let sector = read_logical(handle, geometry, lba, SECTOR_SIZE)?;
        if &sector[1..6] != STANDARD_ID {
            return Err(ArchiveError::bad_structure(format!(
                "sector {lba} is not a volume descriptor"
            )));
        }
        let root = || ParsedRecord::parse(&sector[ROOT_RECORD_OFFSET..ROOT_RECORD_OFFSET + ROOT_RECORD_LEN]);
        match sector[0] {
            VD_PRIMARY if volume.primary.is_none() => volume.primary = Some(root()?),
            VD_SUPPLEMENTARY => {
                let escapes = &sector[ESCAPE_SEQUENCES_OFFSET..ESCAPE_SEQUENCES_OFFSET + 3];
                if JOLIET_LEVELS.contains(&escapes) && volume.joliet.is_none() {
                    volume.joliet = Some(root()?);
                }
            }
            VD_TERMINATOR => return Ok(volume),
            _ => {}
        }
    }
    Err(ArchiveError::bad_structure(
        "volume descriptor set has no terminator",
    ))
}

/// The SUSP skip length when the root "." record starts with an SP entry.
fn rock_ridge_skip(walker: &mut ImageWalker<'_>, root: &ParsedRecord) -> Result<Option<usize>> {
    let records = walker.directory_records(root.extent, root.data_length)?;
    let Some(current) = records.first() else {
        return Ok(None);
    };
    let system_use = &current.system_use;
    if system_use.len() >= 7 && &system_use[..2] == b"SP" && system_use[4..6] == [0xBE, 0xEF] {
        return Ok(Some(system_use[6] as usize));
    }
    Ok(None)
}

pub struct IsoReader {
    source: Arc<dyn ArchiveSource>,
}

impl IsoReader {
    pub fn new(source: Arc<dyn ArchiveSource>) -> IsoReader {
        IsoReader { source }
    }

    fn records(&self, handle: &mut dyn RandomAccess) -> Result<(Naming, Vec<ArchiveEntryRecord>)> {
        let geometry = Geometry::probe(handle)?;
        let volume = read_volume(handle, geometry)?;

        let mut walker = ImageWalker {
            handle,
            geometry,
            naming: Naming::Primary,
            visited: HashSet::new(),
            records: Vec::new(),
        };

        let rock_ridge = match &volume.primary {
            Some(primary) => rock_ridge_skip(&mut walker, primary)?,
            None => None,
        };
        let root = match (rock_ridge, volume.primary, volume.joliet) {
            (Some(skip), Some(primary), _) => {
                walker.naming = Naming::RockRidge { skip };
                primary
            }
            (None, _, Some(joliet)) => {
                walker.naming = Naming::Joliet;
                joliet
            }
            (None, Some(primary), None) => primary,
            _ => {
                return Err(ArchiveError::bad_structure(
                    "image has no primary volume descriptor",
                ))
            }
        };

        walker.walk(root.extent, root.data_length, "")?;
        Ok((walker.naming, walker.records))
    }
}

/// Content of one entry, sector by sector so raw images skip their
/// sector headers.
struct ExtentReader {
    source: SharedSource,
    geometry: Geometry,
    extents: std::vec::IntoIter<(u32, u64)>,
    current: Option<(u32, u64)>,
    position: u64,
}

impl ExtentReader {
    fn new(source: SharedSource, handle: &IsoHandle) -> ExtentReader {
        let mut extents = handle.extents.clone().into_iter();
        let current = extents.next();
        ExtentReader {
            source,
            geometry: handle.geometry,
            extents,
            current,
            position: 0,
        }
    }
}

impl Read for ExtentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let Some((lba, len)) = self.current else {
                return Ok(0);
            };
            if self.position == len {
                self.current = self.extents.next();
                self.position = 0;
                continue;
            }

            let sector = SECTOR_SIZE as u64;
            let within = self.position % sector;
            let wanted = buf
                .len()
                .min((sector - within) as usize)
                .min((len - self.position) as usize);
            let offset = self.geometry.physical(lba as u64 + self.position / sector) + within;

            let read = if self.geometry.sector_size == sector {
                // cooked sectors are contiguous, read across them
                let wanted = buf.len().min((len - self.position) as usize);
                with_handle(&self.source, |handle| {
                    handle.seek(SeekFrom::Start(offset))?;
                    handle.read(&mut buf[..wanted])
                })?
            } else {
                read_at(&self.source, offset, wanted).map(|data| {
                    buf[..wanted].copy_from_slice(&data);
                    wanted
                })?
            };
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("image truncated at offset {offset}"),
                ));
            }
            self.position += read as u64;
            return Ok(read);
        }
    }
}

impl ArchiveReader for IsoReader {
    fn format_name(&self) -> &'static str {
        "ISO9660"
    }

    fn entry_iterator(&self) -> Result<Box<dyn ArchiveEntryIterator>> {
        let mut handle = self.source.open_random()?;
        let (naming, records) = self.records(handle.as_mut())?;
        debug!(
            name = self.source.name(),
            ?naming,
            entries = records.len(),
            "iso directory tree read"
        );
        Ok(Box::new(RecordIterator::new(records, Some(shared(handle)))))
    }

    fn entry_input_stream(
        &self,
        record: &ArchiveEntryRecord,
        iterator: Option<&dyn ArchiveEntryIterator>,
    ) -> Result<Box<dyn Read + Send>> {
        let handle = record
            .handle::<IsoHandle>()
            .ok_or_else(|| ArchiveError::invalid_entry(&record.path, "not an iso entry"))?;
        if record.is_directory {
            return Ok(Box::new(io::empty()));
        }
        let source = reuse_or_open(self.source.as_ref(), iterator)?;
        Ok(Box::new(ExtentReader::new(source, handle)))
    }
}
