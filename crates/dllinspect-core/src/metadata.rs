//! PE header parsing and assembly identity decoding.
//!
//! Recovers an assembly's display name from its image, either as laid out
//! on disk or as mapped into a process. The manifest itself is read through
//! `dotscope`; this module only walks the PE headers far enough to size an
//! image and to undo the loader's section mapping.

use std::fmt;
use std::path::Path;

use dotscope::CilObject;
use dotscope::metadata::tables::{AssemblyRaw, TableId};
use sha1::{Digest, Sha1};

use crate::{Error, Result};

const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // "MZ"
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const CLI_HEADER_DIRECTORY: usize = 14;

// =============================================================================
// Types
// =============================================================================

/// How RVAs map onto the bytes of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    /// Raw file contents; RVAs resolve through the section table.
    File,
    /// Loaded by the OS loader; an RVA is a plain offset.
    Mapped,
}

/// Identity fields of an assembly manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyIdentity {
    pub name: String,
    pub version: [u16; 4],
    /// Empty for culture-neutral assemblies.
    pub culture: String,
    pub public_key_token: Option<[u8; 8]>,
}

impl fmt::Display for AssemblyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, build, revision] = self.version;
        let culture = if self.culture.is_empty() {
            "neutral"
        } else {
            self.culture.as_str()
        };
        write!(
            f,
            "{}, Version={}.{}.{}.{}, Culture={}, PublicKeyToken=",
            self.name, major, minor, build, revision, culture
        )?;
        match &self.public_key_token {
            Some(token) => token.iter().try_for_each(|b| write!(f, "{:02x}", b)),
            None => f.write_str("null"),
        }
    }
}

#[derive(Debug, Clone)]
struct SectionInfo {
    virtual_address: u32,
    pointer_to_raw_data: u32,
    size_of_raw_data: u32,
}

/// The parts of the PE headers needed to locate CLI metadata.
#[derive(Debug, Clone)]
pub struct PeInfo {
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub is_pe32_plus: bool,
    cli_header: Option<(u32, u32)>,
    sections: Vec<SectionInfo>,
}

impl PeInfo {
    /// Whether the image carries a CLI header at all.
    pub fn is_managed(&self) -> bool {
        self.cli_header.is_some_and(|(rva, size)| rva != 0 && size != 0)
    }
}

// =============================================================================
// Little-endian readers
// =============================================================================

fn bytes_at(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| Error::Metadata(format!("read of {} bytes at 0x{:X} out of bounds", len, offset)))
}

fn u16_at(data: &[u8], offset: usize) -> Result<u16> {
    let b = bytes_at(data, offset, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn u32_at(data: &[u8], offset: usize) -> Result<u32> {
    let b = bytes_at(data, offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

// =============================================================================
// PE Header Reading
// =============================================================================

/// Parse DOS, COFF and optional headers plus the section table.
pub fn read_pe_info(image: &[u8]) -> Result<PeInfo> {
    if u16_at(image, 0)? != IMAGE_DOS_SIGNATURE {
        return Err(Error::Metadata("missing MZ signature".into()));
    }

    let e_lfanew = u32_at(image, 0x3C)? as usize;
    if !(64..=1024).contains(&e_lfanew) {
        return Err(Error::Metadata(format!("implausible e_lfanew 0x{:X}", e_lfanew)));
    }
    if u32_at(image, e_lfanew)? != IMAGE_NT_SIGNATURE {
        return Err(Error::Metadata("missing PE signature".into()));
    }

    let coff = e_lfanew + 4;
    let number_of_sections = u16_at(image, coff + 2)?;
    let size_of_optional_header = u16_at(image, coff + 16)? as usize;
    if number_of_sections > 96 {
        return Err(Error::Metadata(format!("{} sections", number_of_sections)));
    }

    let optional = coff + 20;
    let is_pe32_plus = match u16_at(image, optional)? {
        PE32_MAGIC => false,
        PE32_PLUS_MAGIC => true,
        other => return Err(Error::Metadata(format!("unknown optional header magic 0x{:X}", other))),
    };

    let size_of_image = u32_at(image, optional + 56)?;
    let size_of_headers = u32_at(image, optional + 60)?;

    let (rva_count_offset, directories) = if is_pe32_plus {
        (optional + 108, optional + 112)
    } else {
        (optional + 92, optional + 96)
    };
    let number_of_rva_and_sizes = u32_at(image, rva_count_offset)? as usize;
    let cli_header = if number_of_rva_and_sizes > CLI_HEADER_DIRECTORY {
        let entry = directories + CLI_HEADER_DIRECTORY * 8;
        Some((u32_at(image, entry)?, u32_at(image, entry + 4)?))
    } else {
        None
    };

    let section_table = optional + size_of_optional_header;
    let mut sections = Vec::with_capacity(number_of_sections as usize);
    for i in 0..number_of_sections as usize {
        let offset = section_table + i * 40;
        sections.push(SectionInfo {
            virtual_address: u32_at(image, offset + 12)?,
            size_of_raw_data: u32_at(image, offset + 16)?,
            pointer_to_raw_data: u32_at(image, offset + 20)?,
        });
    }

    Ok(PeInfo {
        size_of_image,
        size_of_headers,
        is_pe32_plus,
        cli_header,
        sections,
    })
}

/// Rebuild the on-disk layout of an image the OS loader has mapped.
///
/// Every section is moved from its RVA back to its raw file offset. Bytes
/// past the end of `image` are left zeroed.
pub fn mapped_to_file_layout(image: &[u8]) -> Result<Vec<u8>> {
    let pe = read_pe_info(image)?;
    let headers = (pe.size_of_headers as usize).min(image.len());
    let len = pe
        .sections
        .iter()
        .map(|s| s.pointer_to_raw_data as usize + s.size_of_raw_data as usize)
        .fold(headers, usize::max);

    let mut file = vec![0u8; len];
    file[..headers].copy_from_slice(&image[..headers]);
    for section in &pe.sections {
        let from = section.virtual_address as usize;
        let to = section.pointer_to_raw_data as usize;
        let Some(mapped) = image.get(from..) else {
            continue;
        };
        let count = (section.size_of_raw_data as usize).min(mapped.len());
        file[to..to + count].copy_from_slice(&mapped[..count]);
    }
    Ok(file)
}

// =============================================================================
// Assembly Identity
// =============================================================================

fn public_key_token(public_key: &[u8]) -> Option<[u8; 8]> {
    if public_key.is_empty() {
        return None;
    }
    let digest = Sha1::digest(public_key);
    let mut token = [0u8; 8];
    for (dst, src) in token.iter_mut().zip(digest.iter().rev()) {
        *dst = *src;
    }
    Some(token)
}

fn metadata_error(err: dotscope::Error) -> Error {
    Error::Metadata(err.to_string())
}

fn identity_of(object: &CilObject) -> Result<AssemblyIdentity> {
    let row = object
        .tables()
        .and_then(|tables| tables.table::<AssemblyRaw>(TableId::Assembly))
        .and_then(|table| table.get(1))
        .ok_or_else(|| Error::Metadata("image has no assembly manifest".into()))?;
    let strings = object
        .strings()
        .ok_or_else(|| Error::Metadata("image has no string heap".into()))?;

    let culture = match row.culture {
        0 => "",
        index => strings.get(index as usize).map_err(metadata_error)?,
    };
    let public_key = match (row.public_key, object.blob()) {
        (0, _) | (_, None) => &[][..],
        (index, Some(blobs)) => blobs.get(index as usize).map_err(metadata_error)?,
    };

    Ok(AssemblyIdentity {
        name: strings.get(row.name as usize).map_err(metadata_error)?.to_string(),
        version: [
            row.major_version,
            row.minor_version,
            row.build_number,
            row.revision_number,
        ]
        .map(|part| part as u16),
        culture: culture.to_string(),
        public_key_token: public_key_token(public_key),
    })
}

/// Decode the assembly identity from a managed PE image.
///
/// A [`ImageLayout::Mapped`] image is first rebuilt into file layout.
pub fn read_assembly_identity(image: &[u8], layout: ImageLayout) -> Result<AssemblyIdentity> {
    if !read_pe_info(image)?.is_managed() {
        return Err(Error::Metadata("not a managed image".into()));
    }
    let file = match layout {
        ImageLayout::File => image.to_vec(),
        ImageLayout::Mapped => mapped_to_file_layout(image)?,
    };
    let object = CilObject::from_mem(file).map_err(metadata_error)?;
    identity_of(&object)
}

/// Decode the assembly identity of an assembly file on disk.
pub fn read_assembly_identity_from_file(path: &Path) -> Result<AssemblyIdentity> {
    let object = CilObject::from_file(path).map_err(metadata_error)?;
    identity_of(&object)
}
