//! Synthetic managed PE images for tests.

use crate::metadata::ImageLayout;

/// The ECMA-335 standard public key (token `b77a5c561934e089`).
pub const ECMA_PUBLIC_KEY: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0];

const FILE_ALIGNMENT: usize = 0x200;
const SECTION_RVA: usize = 0x2000;
const E_LFANEW: usize = 0x80;
const CLI_HEADER_SIZE: usize = 72;

pub struct ImageSpec {
    name: String,
    version: [u16; 4],
    culture: String,
    public_key: Vec<u8>,
}

impl ImageSpec {
    pub fn new(name: &str, version: [u16; 4]) -> Self {
        Self {
            name: name.to_string(),
            version,
            culture: String::new(),
            public_key: Vec::new(),
        }
    }

    pub fn culture(mut self, culture: &str) -> Self {
        self.culture = culture.to_string();
        self
    }

    pub fn public_key(mut self, key: &[u8]) -> Self {
        self.public_key = key.to_vec();
        self
    }
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn metadata(spec: &ImageSpec) -> Vec<u8> {
    // #Strings: "", module name, assembly name, culture
    let mut strings = vec![0u8];
    let module_name = strings.len() as u16;
    strings.extend_from_slice(format!("{}.dll\0", spec.name).as_bytes());
    let assembly_name = strings.len() as u16;
    strings.extend_from_slice(spec.name.as_bytes());
    strings.push(0);
    let culture = if spec.culture.is_empty() {
        0
    } else {
        let index = strings.len() as u16;
        strings.extend_from_slice(spec.culture.as_bytes());
        strings.push(0);
        index
    };
    pad4(&mut strings);

    let mut blobs = vec![0u8];
    let key_index = if spec.public_key.is_empty() {
        0
    } else {
        let index = blobs.len() as u16;
        blobs.push(spec.public_key.len() as u8);
        blobs.extend_from_slice(&spec.public_key);
        index
    };
    pad4(&mut blobs);

    let guids = vec![0x11u8; 16];

    // #~ with one Module row and one Assembly row.
    let mut tables = Vec::new();
    tables.extend_from_slice(&0u32.to_le_bytes());
    tables.extend_from_slice(&[2, 0, 0, 1]);
    tables.extend_from_slice(&((1u64 << 0x00) | (1u64 << 0x20)).to_le_bytes());
    tables.extend_from_slice(&0u64.to_le_bytes());
    tables.extend_from_slice(&1u32.to_le_bytes());
    tables.extend_from_slice(&1u32.to_le_bytes());
    // Module: Generation, Name, Mvid, EncId, EncBaseId
    tables.extend_from_slice(&0u16.to_le_bytes());
    tables.extend_from_slice(&module_name.to_le_bytes());
    tables.extend_from_slice(&1u16.to_le_bytes());
    tables.extend_from_slice(&0u16.to_le_bytes());
    tables.extend_from_slice(&0u16.to_le_bytes());
    // Assembly
    tables.extend_from_slice(&0x8004u32.to_le_bytes());
    for part in spec.version {
        tables.extend_from_slice(&part.to_le_bytes());
    }
    let flags: u32 = if spec.public_key.is_empty() { 0 } else { 1 };
    tables.extend_from_slice(&flags.to_le_bytes());
    tables.extend_from_slice(&key_index.to_le_bytes());
    tables.extend_from_slice(&assembly_name.to_le_bytes());
    tables.extend_from_slice(&culture.to_le_bytes());
    pad4(&mut tables);

    let version = b"v4.0.30319\0\0";
    let streams: [(&[u8], &[u8]); 4] = [
        (&b"#~"[..], &tables[..]),
        (&b"#Strings"[..], &strings[..]),
        (&b"#GUID"[..], &guids[..]),
        (&b"#Blob"[..], &blobs[..]),
    ];

    let mut header_len = 16 + version.len() + 4;
    for (name, _) in &streams {
        header_len += 8 + (name.len() + 1).next_multiple_of(4);
    }

    let mut root = Vec::new();
    root.extend_from_slice(&0x424A_5342u32.to_le_bytes());
    root.extend_from_slice(&1u16.to_le_bytes());
    root.extend_from_slice(&1u16.to_le_bytes());
    root.extend_from_slice(&0u32.to_le_bytes());
    root.extend_from_slice(&(version.len() as u32).to_le_bytes());
    root.extend_from_slice(version);
    root.extend_from_slice(&0u16.to_le_bytes());
    root.extend_from_slice(&(streams.len() as u16).to_le_bytes());

    let mut data_offset = header_len;
    for (name, data) in &streams {
        root.extend_from_slice(&(data_offset as u32).to_le_bytes());
        root.extend_from_slice(&(data.len() as u32).to_le_bytes());
        root.extend_from_slice(name);
        root.push(0);
        pad4(&mut root);
        data_offset += data.len();
    }
    assert_eq!(root.len(), header_len);

    for (_, data) in &streams {
        root.extend_from_slice(data);
    }
    root
}

/// Build a minimal PE32 DLL whose only section holds a CLI header and metadata.
pub fn build_image(spec: &ImageSpec, layout: ImageLayout) -> Vec<u8> {
    let metadata = metadata(spec);

    let mut section = vec![0u8; CLI_HEADER_SIZE];
    put_u32(&mut section, 0, CLI_HEADER_SIZE as u32);
    put_u16(&mut section, 4, 2);
    put_u16(&mut section, 6, 5);
    put_u32(&mut section, 8, (SECTION_RVA + CLI_HEADER_SIZE) as u32);
    put_u32(&mut section, 12, metadata.len() as u32);
    put_u32(&mut section, 16, 1);
    section.extend_from_slice(&metadata);

    let raw_size = section.len().next_multiple_of(FILE_ALIGNMENT);
    let size_of_image = (SECTION_RVA + raw_size).next_multiple_of(0x1000);

    let mut headers = vec![0u8; FILE_ALIGNMENT];
    put_u16(&mut headers, 0, 0x5A4D);
    put_u32(&mut headers, 0x3C, E_LFANEW as u32);
    put_u32(&mut headers, E_LFANEW, 0x0000_4550);

    let coff = E_LFANEW + 4;
    put_u16(&mut headers, coff, 0x014c);
    put_u16(&mut headers, coff + 2, 1);
    put_u16(&mut headers, coff + 16, 224);
    put_u16(&mut headers, coff + 18, 0x2102);

    let optional = coff + 20;
    put_u16(&mut headers, optional, 0x10b);
    put_u32(&mut headers, optional + 4, raw_size as u32);
    put_u32(&mut headers, optional + 20, SECTION_RVA as u32);
    put_u32(&mut headers, optional + 28, 0x1000_0000);
    put_u32(&mut headers, optional + 32, 0x1000);
    put_u32(&mut headers, optional + 36, FILE_ALIGNMENT as u32);
    put_u32(&mut headers, optional + 56, size_of_image as u32);
    put_u32(&mut headers, optional + 60, FILE_ALIGNMENT as u32);
    put_u16(&mut headers, optional + 48, 4);
    put_u16(&mut headers, optional + 68, 3);
    put_u32(&mut headers, optional + 92, 16);
    let cli_directory = optional + 96 + 14 * 8;
    put_u32(&mut headers, cli_directory, SECTION_RVA as u32);
    put_u32(&mut headers, cli_directory + 4, CLI_HEADER_SIZE as u32);

    let section_header = optional + 224;
    headers[section_header..section_header + 5].copy_from_slice(b".text");
    put_u32(&mut headers, section_header + 8, section.len() as u32);
    put_u32(&mut headers, section_header + 12, SECTION_RVA as u32);
    put_u32(&mut headers, section_header + 16, raw_size as u32);
    put_u32(&mut headers, section_header + 20, FILE_ALIGNMENT as u32);
    put_u32(&mut headers, section_header + 36, 0x6000_0020);

    let (section_offset, total) = match layout {
        ImageLayout::File => (FILE_ALIGNMENT, FILE_ALIGNMENT + raw_size),
        ImageLayout::Mapped => (SECTION_RVA, size_of_image),
    };

    let mut image = vec![0u8; total];
    image[..headers.len()].copy_from_slice(&headers);
    image[section_offset..section_offset + section.len()].copy_from_slice(&section);
    image
}
