//! Access to the CLI part of PE images through goblin

use crate::assembly::{AssemblyImage, InteropExtractor};
use crate::common::LookupError;
use crate::metadata::Metadata;
use fs_err as fs;
use goblin::pe::section_table::SectionTable;
use goblin::pe::PE;
use std::path::Path;

/// Offset of the metadata directory (RVA, size) inside the CLI header
const CLI_METADATA_DIRECTORY: usize = 8;

/// File offset of a relative virtual address, if some section maps it
pub fn rva_to_offset(sections: &[SectionTable], rva: u32) -> Option<usize> {
    sections.iter().find_map(|section| {
        let mapped = section.virtual_size.max(section.size_of_raw_data);
        let end = section.virtual_address.checked_add(mapped)?;
        if section.virtual_address <= rva && rva < end {
            Some((rva - section.virtual_address) as usize + section.pointer_to_raw_data as usize)
        } else {
            None
        }
    })
}

fn slice_at(data: &[u8], offset: usize, size: usize) -> Result<&[u8], LookupError> {
    data.get(offset..offset.saturating_add(size)).ok_or_else(|| {
        LookupError::MetadataError(format!(
            "{} bytes at {:#x} are outside of the file",
            size, offset
        ))
    })
}

/// Bytes of the metadata root of a CLI image
///
/// `Ok(None)` if the data is not a PE file, or a PE file without CLI header (native code).
pub fn cli_metadata(data: &[u8]) -> Result<Option<&[u8]>, LookupError> {
    let pe = match PE::parse(data) {
        Ok(pe) => pe,
        Err(e) => {
            tracing::trace!("not a PE image: {}", e);
            return Ok(None);
        }
    };
    let Some(clr) = pe
        .header
        .optional_header
        .as_ref()
        .and_then(|h| h.data_directories.get_clr_runtime_header())
        .filter(|d| d.virtual_address != 0)
    else {
        return Ok(None);
    };

    let unmapped = |rva: u32| {
        LookupError::MetadataError(format!("RVA {:#x} is not mapped by any section", rva))
    };
    let cli_offset = rva_to_offset(&pe.sections, clr.virtual_address)
        .ok_or_else(|| unmapped(clr.virtual_address))?;
    let cli_header = slice_at(data, cli_offset, clr.size as usize)?;
    let directory = slice_at(cli_header, CLI_METADATA_DIRECTORY, 8)?;
    let metadata_rva = u32::from_le_bytes([directory[0], directory[1], directory[2], directory[3]]);
    let metadata_size = u32::from_le_bytes([directory[4], directory[5], directory[6], directory[7]]);

    let metadata_offset =
        rva_to_offset(&pe.sections, metadata_rva).ok_or_else(|| unmapped(metadata_rva))?;
    Ok(Some(slice_at(data, metadata_offset, metadata_size as usize)?))
}

/// Reads interop declarations straight from the metadata tables of the image
#[derive(Debug, Default, Clone, Copy)]
pub struct PeInteropExtractor;

impl PeInteropExtractor {
    fn read_image(data: &[u8]) -> Result<Option<AssemblyImage>, LookupError> {
        let Some(metadata) = cli_metadata(data)? else {
            return Ok(None);
        };
        let metadata = Metadata::parse(metadata)?;
        // a bare module has no assembly manifest and cannot be loaded on its own
        let Some(identity) = metadata.assembly()? else {
            return Ok(None);
        };
        Ok(Some(AssemblyImage {
            identity,
            pinvoke_modules: metadata.pinvoke_modules()?,
            references: metadata.assembly_refs()?,
        }))
    }
}

impl InteropExtractor for PeInteropExtractor {
    fn extract(&self, path: &Path) -> Result<Option<AssemblyImage>, LookupError> {
        let content = fs::read(path)?;
        Self::read_image(&content).map_err(|e| match e {
            LookupError::MetadataError(reason) => {
                LookupError::MetadataError(format!("{}: {}", path.display(), reason))
            }
            e => e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(virtual_address: u32, virtual_size: u32, pointer_to_raw_data: u32) -> SectionTable {
        SectionTable {
            virtual_address,
            virtual_size,
            size_of_raw_data: virtual_size,
            pointer_to_raw_data,
            ..Default::default()
        }
    }

    #[test]
    fn map_rva() {
        let sections = [section(0x2000, 0x1000, 0x200), section(0x4000, 0x200, 0x1200)];
        assert_eq!(rva_to_offset(&sections, 0x2000), Some(0x200));
        assert_eq!(rva_to_offset(&sections, 0x2008), Some(0x208));
        assert_eq!(rva_to_offset(&sections, 0x4010), Some(0x1210));
        assert_eq!(rva_to_offset(&sections, 0x3000), None);
        assert_eq!(rva_to_offset(&sections, 0x100), None);
    }

    const TEXT_RVA: u32 = 0x2000;
    const TEXT_OFFSET: usize = 0x200;
    const CLI_HEADER_SIZE: u32 = 0x48;

    fn put(image: &mut [u8], offset: usize, bytes: &[u8]) {
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// PE32 image with a single .text section holding the CLI header followed by `metadata`
    fn pe32_image(metadata: &[u8]) -> Vec<u8> {
        let text_size = (CLI_HEADER_SIZE as usize + metadata.len() + 0x1ff) & !0x1ff;
        let mut image = vec![0u8; TEXT_OFFSET + text_size];

        put(&mut image, 0, b"MZ");
        put(&mut image, 0x3c, &0x80u32.to_le_bytes());
        put(&mut image, 0x80, b"PE\0\0");
        // COFF header: i386, one section, optional header of 0xe0 bytes, executable
        put(&mut image, 0x84, &0x14cu16.to_le_bytes());
        put(&mut image, 0x86, &1u16.to_le_bytes());
        put(&mut image, 0x94, &0xe0u16.to_le_bytes());
        put(&mut image, 0x96, &0x0102u16.to_le_bytes());

        let optional = 0x98;
        put(&mut image, optional, &0x10bu16.to_le_bytes());
        put(&mut image, optional + 28, &0x0040_0000u32.to_le_bytes());
        put(&mut image, optional + 32, &0x2000u32.to_le_bytes());
        put(&mut image, optional + 36, &0x200u32.to_le_bytes());
        put(&mut image, optional + 40, &4u16.to_le_bytes());
        put(&mut image, optional + 48, &4u16.to_le_bytes());
        let size_of_image = TEXT_RVA + text_size as u32;
        put(&mut image, optional + 56, &size_of_image.to_le_bytes());
        put(&mut image, optional + 60, &(TEXT_OFFSET as u32).to_le_bytes());
        put(&mut image, optional + 68, &3u16.to_le_bytes());
        put(&mut image, optional + 92, &16u32.to_le_bytes());
        // data directory 14: CLI header
        let clr_directory = optional + 96 + 14 * 8;
        put(&mut image, clr_directory, &TEXT_RVA.to_le_bytes());
        put(&mut image, clr_directory + 4, &CLI_HEADER_SIZE.to_le_bytes());

        let section = optional + 0xe0;
        put(&mut image, section, b".text\0\0\0");
        put(&mut image, section + 8, &(text_size as u32).to_le_bytes());
        put(&mut image, section + 12, &TEXT_RVA.to_le_bytes());
        put(&mut image, section + 16, &(text_size as u32).to_le_bytes());
        put(&mut image, section + 20, &(TEXT_OFFSET as u32).to_le_bytes());
        put(&mut image, section + 36, &0x6000_0020u32.to_le_bytes());

        // CLI header: cb, runtime 2.5, metadata directory, IL only
        put(&mut image, TEXT_OFFSET, &CLI_HEADER_SIZE.to_le_bytes());
        put(&mut image, TEXT_OFFSET + 4, &2u16.to_le_bytes());
        put(&mut image, TEXT_OFFSET + 6, &5u16.to_le_bytes());
        let metadata_rva = TEXT_RVA + CLI_HEADER_SIZE;
        put(&mut image, TEXT_OFFSET + 8, &metadata_rva.to_le_bytes());
        put(&mut image, TEXT_OFFSET + 12, &(metadata.len() as u32).to_le_bytes());
        put(&mut image, TEXT_OFFSET + 16, &1u32.to_le_bytes());
        put(&mut image, TEXT_OFFSET + CLI_HEADER_SIZE as usize, metadata);
        image
    }

    #[test]
    fn extract_from_image() -> Result<(), LookupError> {
        let metadata = crate::metadata::tests::sample_metadata();
        let image = pe32_image(&metadata);
        assert_eq!(cli_metadata(&image)?, Some(&metadata[..]));

        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("App.exe");
        fs::write(&path, &image)?;
        let assembly = PeInteropExtractor
            .extract(&path)?
            .ok_or_else(|| LookupError::NotAnAssembly(path.clone()))?;
        assert_eq!(
            assembly.identity.full_name(),
            "App, Version=1.2.3.4, Culture=neutral, PublicKeyToken=null"
        );
        assert_eq!(assembly.pinvoke_modules, vec!["m", "libc", "m"]);
        assert_eq!(assembly.references.len(), 1);
        assert_eq!(assembly.references[0].name, "mscorlib");
        Ok(())
    }

    #[test]
    fn native_image_has_no_metadata() -> Result<(), LookupError> {
        let mut image = pe32_image(&crate::metadata::tests::sample_metadata());
        let clr_directory = 0x98 + 96 + 14 * 8;
        put(&mut image, clr_directory, &[0u8; 8]);
        assert_eq!(cli_metadata(&image)?, None);
        Ok(())
    }

    #[test]
    fn not_a_pe_file()-> Result<(), LookupError> {
        let tmp = tempfile::tempdir()?;
        let elf = tmp.path().join("libfake.so");
        fs::write(&elf, b"\x7fELF\x02\x01\x01\0\0\0\0\0\0\0\0\0")?;
        let empty = tmp.path().join("Empty.dll");
        fs::write(&empty, b"")?;

        assert!(PeInteropExtractor.extract(&elf)?.is_none());
        assert!(PeInteropExtractor.extract(&empty)?.is_none());
        assert!(PeInteropExtractor.extract(&tmp.path().join("missing.dll")).is_err());
        Ok(())
    }
}
