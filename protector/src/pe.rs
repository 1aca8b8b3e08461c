use std::collections::HashSet;
use std::path::Path;

use exe::{
    Arch, Buffer, ImageBaseRelocation, ImageDirectoryEntry, ImageExportDirectory,
    ImageSectionHeader, NTHeaders, NTHeadersMut, PETranslation, ThunkData, VecPE, PE, RVA,
};

use crate::error::ProtectError;
use crate::section::Section;

pub const IMAGE_REL_BASED_ABSOLUTE: u8 = 0;
pub const IMAGE_REL_BASED_HIGHLOW: u8 = 3;
pub const IMAGE_REL_BASED_DIR64: u8 = 10;

pub fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

pub fn align_down(value: u32, alignment: u32) -> u32 {
    value & !(alignment - 1)
}

/// One entry of a base relocation block: a 16-bit word whose top 4 bits
/// are the relocation type and whose low 12 bits are the offset within
/// the owning 4 KiB page.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry(pub u16);

impl RelocationEntry {
    pub fn new(reloc_type: u8, page_offset: u16) -> Self {
        Self(((reloc_type as u16) << 12) | (page_offset & 0x0FFF))
    }

    pub fn reloc_type(self) -> u8 {
        (self.0 >> 12) as u8
    }

    pub fn page_offset(self) -> u16 {
        self.0 & 0x0FFF
    }
}

/// Parsed host or sidecar image. The underlying buffer stays in disk
/// layout and is mutated in place by the protection pass.
pub struct PeImage {
    pe: VecPE,
    arch: Arch,
    image_base: u64,
    entry_point: u32,
    section_alignment: u32,
    file_alignment: u32,
    size_of_headers: u32,
}

impl PeImage {
    pub fn parse(data: &[u8]) -> Result<Self, ProtectError> {
        let pe = VecPE::from_disk_data(data);

        pe.get_valid_dos_header()
            .map_err(|e| ProtectError::InvalidHostPe(format!("bad dos header: {:?}", e)))?;

        let (section_alignment, file_alignment, size_of_headers) = match pe
            .get_valid_nt_headers()
            .map_err(|e| ProtectError::InvalidHostPe(format!("bad nt headers: {:?}", e)))?
        {
            NTHeaders::NTHeaders32(h) => (
                h.optional_header.section_alignment,
                h.optional_header.file_alignment,
                h.optional_header.size_of_headers,
            ),
            NTHeaders::NTHeaders64(h) => (
                h.optional_header.section_alignment,
                h.optional_header.file_alignment,
                h.optional_header.size_of_headers,
            ),
        };

        let arch = pe.get_arch()?;
        let image_base = pe.get_image_base()?;
        let entry_point = pe.get_entrypoint()?.0;

        Ok(Self {
            pe,
            arch,
            image_base,
            entry_point,
            section_alignment,
            file_alignment,
            size_of_headers,
        })
    }

    pub fn from_disk_file<P: AsRef<Path>>(path: P) -> Result<Self, ProtectError> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    pub fn section_alignment(&self) -> u32 {
        self.section_alignment
    }

    pub fn file_alignment(&self) -> u32 {
        self.file_alignment
    }

    pub fn data(&self) -> &[u8] {
        self.pe.as_slice()
    }

    pub fn len(&self) -> usize {
        self.pe.len()
    }

    pub fn rva_to_file_offset(&self, rva: u32) -> Result<usize, ProtectError> {
        Ok(self.pe.translate(PETranslation::Memory(RVA(rva)))?)
    }

    pub fn file_offset_to_rva(&self, offset: usize) -> Result<u32, ProtectError> {
        Ok(self.pe.offset_to_rva(exe::Offset(offset as u32))?.0)
    }

    pub fn section_by_name(&self, name: &str) -> Result<ImageSectionHeader, ProtectError> {
        Ok(self.pe.get_section_by_name(name.to_string())?)
    }

    pub fn section_by_rva(&self, rva: u32) -> Option<ImageSectionHeader> {
        self.pe.get_section_by_rva(RVA(rva)).ok()
    }

    pub fn section_table(&self) -> Result<Vec<ImageSectionHeader>, ProtectError> {
        Ok(self.pe.get_section_table()?.to_vec())
    }

    /// Deep copy of a section's raw payload.
    pub fn copy_section_data(
        &self,
        header: &ImageSectionHeader,
    ) -> Result<Vec<u8>, ProtectError> {
        if header.size_of_raw_data == 0 {
            return Ok(Vec::new());
        }
        let offset = header.pointer_to_raw_data.0 as usize;
        let data = self.pe.read(offset, header.size_of_raw_data as usize)?;
        Ok(data.to_vec())
    }

    pub fn data_directory(
        &self,
        entry: ImageDirectoryEntry,
    ) -> Result<(u32, u32), ProtectError> {
        let dir = self.pe.get_data_directory(entry)?;
        Ok((dir.virtual_address.0, dir.size))
    }

    pub fn set_data_directory(
        &mut self,
        entry: ImageDirectoryEntry,
        virtual_address: u32,
        size: u32,
    ) -> Result<(), ProtectError> {
        let mut dir = self.pe.get_mut_data_directory(entry)?;
        dir.virtual_address = RVA(virtual_address);
        dir.size = size;
        Ok(())
    }

    /// File offset of a data directory entry's `VirtualAddress` field
    /// inside the headers.
    pub fn data_directory_entry_offset(
        &self,
        entry: ImageDirectoryEntry,
    ) -> Result<u32, ProtectError> {
        let table_offset = self.pe.get_data_directory_offset()?;
        Ok(table_offset.0 + (entry as u32) * 8)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, ProtectError> {
        let bytes = self.pe.read(offset, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, ProtectError> {
        let bytes = self.pe.read(offset, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<(), ProtectError> {
        self.pe.write(offset, value.to_le_bytes())?;
        Ok(())
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<(), ProtectError> {
        self.pe.write(offset, value.to_le_bytes())?;
        Ok(())
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), ProtectError> {
        self.pe.write(offset, data)?;
        Ok(())
    }

    /// Walks every base relocation entry, handing the visitor the block
    /// page RVA, the entry's effective RVA and the raw entry word.
    pub fn each_relocation(
        &self,
        mut visit: impl FnMut(u32, u32, RelocationEntry),
    ) -> Result<(), ProtectError> {
        let (dir_rva, dir_size) = self.data_directory(ImageDirectoryEntry::BaseReloc)?;
        if dir_rva == 0 || dir_size == 0 {
            return Ok(());
        }

        let mut offset = self.rva_to_file_offset(dir_rva)?;
        let end = offset + dir_size as usize;

        while offset + 8 <= end {
            let block = *self.pe.get_aligned_ref::<ImageBaseRelocation>(offset)?;
            if block.size_of_block < 8 {
                break;
            }
            let count = (block.size_of_block as usize - 8) / 2;
            for i in 0..count {
                let word = self.pe.read(offset + 8 + i * 2, 2)?;
                let entry = RelocationEntry(u16::from_le_bytes(word.try_into().unwrap()));
                let rva = block.virtual_address.0 + entry.page_offset() as u32;
                visit(block.virtual_address.0, rva, entry);
            }
            offset += block.size_of_block as usize;
        }

        Ok(())
    }

    /// RVAs of every non-padding relocation entry, in table order.
    pub fn relocation_rvas(&self) -> Result<Vec<u64>, ProtectError> {
        let mut rvas = Vec::new();
        self.each_relocation(|_, rva, entry| {
            if entry.reloc_type() != IMAGE_REL_BASED_ABSOLUTE {
                rvas.push(rva as u64);
            }
        })?;
        Ok(rvas)
    }

    /// Neutralizes the entries whose RVA appears in `rvas` by rewriting
    /// them into `ABSOLUTE` padding with a zero page offset.
    pub fn remove_relocations(&mut self, rvas: &[u64]) -> Result<(), ProtectError> {
        let doomed: HashSet<u64> = rvas.iter().copied().collect();

        let mut patches: Vec<usize> = Vec::new();
        let (dir_rva, dir_size) = self.data_directory(ImageDirectoryEntry::BaseReloc)?;
        if dir_rva == 0 || dir_size == 0 {
            return Ok(());
        }

        let mut offset = self.rva_to_file_offset(dir_rva)?;
        let end = offset + dir_size as usize;
        while offset + 8 <= end {
            let block = *self.pe.get_aligned_ref::<ImageBaseRelocation>(offset)?;
            if block.size_of_block < 8 {
                break;
            }
            let count = (block.size_of_block as usize - 8) / 2;
            for i in 0..count {
                let entry_offset = offset + 8 + i * 2;
                let word = self.pe.read(entry_offset, 2)?;
                let entry = RelocationEntry(u16::from_le_bytes(word.try_into().unwrap()));
                let rva = block.virtual_address.0 + entry.page_offset() as u32;
                if doomed.contains(&(rva as u64)) {
                    patches.push(entry_offset);
                }
            }
            offset += block.size_of_block as usize;
        }

        for entry_offset in patches {
            self.pe.write(entry_offset, 0u16.to_le_bytes())?;
        }

        Ok(())
    }

    /// Applies every `HIGHLOW`/`DIR64` relocation against `delta`, as if
    /// the image were rebased by that amount.
    pub fn relocate(&mut self, delta: i64) -> Result<(), ProtectError> {
        let mut targets: Vec<(u64, u8)> = Vec::new();
        self.each_relocation(|_, rva, entry| {
            let reloc_type = entry.reloc_type();
            if reloc_type == IMAGE_REL_BASED_HIGHLOW || reloc_type == IMAGE_REL_BASED_DIR64 {
                targets.push((rva as u64, reloc_type));
            }
        })?;

        for (rva, reloc_type) in targets {
            let offset = self.rva_to_file_offset(rva as u32)?;
            if reloc_type == IMAGE_REL_BASED_HIGHLOW {
                let value = self.read_u32(offset)?;
                self.write_u32(offset, value.wrapping_add(delta as u32))?;
            } else {
                let value = self.read_u64(offset)?;
                self.write_u64(offset, value.wrapping_add(delta as u64))?;
            }
        }

        Ok(())
    }

    /// Exported symbols as `(name, rva)` pairs.
    pub fn exports(&self) -> Result<Vec<(String, u32)>, ProtectError> {
        let directory = ImageExportDirectory::parse(&self.pe)?;
        let map = directory.get_export_map(&self.pe)?;

        let mut exports = Vec::new();
        for (name, thunk) in map {
            if let ThunkData::Function(rva) = thunk {
                exports.push((name.to_string(), rva.0));
            }
        }
        Ok(exports)
    }

    /// Copy of the header region (everything up to `SizeOfHeaders`).
    pub fn header_data(&self) -> Result<Vec<u8>, ProtectError> {
        Ok(self.pe.read(0, self.size_of_headers as usize)?.to_vec())
    }

    /// Zeroes a data directory's payload bytes and its directory entry.
    pub fn nullify_data_directory(
        &mut self,
        entry: ImageDirectoryEntry,
    ) -> Result<(), ProtectError> {
        let (rva, size) = match self.data_directory(entry) {
            Ok(d) => d,
            Err(_) => return Ok(()),
        };

        if rva != 0 && size != 0 {
            if let Ok(offset) = self.rva_to_file_offset(rva) {
                let zeroes = vec![0u8; size as usize];
                self.pe.write(offset, zeroes)?;
            }
        }

        self.set_data_directory(entry, 0, 0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.pe.as_slice().to_vec()
    }
}

/// Section offset helpers shared by the pipeline and the resolver.
pub fn rva_to_section_offset(header: &ImageSectionHeader, rva: u32) -> u32 {
    rva - header.virtual_address.0
}

pub fn section_offset_to_rva(header: &ImageSectionHeader, offset: u32) -> u32 {
    header.virtual_address.0 + offset
}

pub fn is_rva_within_section(header: &ImageSectionHeader, rva: u64) -> bool {
    let begin = header.virtual_address.0 as u64;
    let size = header.virtual_size.max(header.size_of_raw_data) as u64;
    rva >= begin && rva < begin + size
}

/// Rebuilds a PE from copied header data plus an ordered section list.
///
/// Raw pointers are reassigned sequentially at file alignment. Sections
/// that already carry a virtual address keep it; fresh sections (virtual
/// address zero) are placed after the previous section at the section
/// alignment. `SizeOfImage` and the section count are recomputed.
pub fn build(header_data: Vec<u8>, sections: Vec<Section>) -> Result<PeImage, ProtectError> {
    let mut header_pe = VecPE::from_disk_data(&header_data);

    let (section_alignment, file_alignment, size_of_headers) =
        match header_pe.get_valid_nt_headers()? {
            NTHeaders::NTHeaders32(h) => (
                h.optional_header.section_alignment,
                h.optional_header.file_alignment,
                h.optional_header.size_of_headers,
            ),
            NTHeaders::NTHeaders64(h) => (
                h.optional_header.section_alignment,
                h.optional_header.file_alignment,
                h.optional_header.size_of_headers,
            ),
        };

    let e_lfanew = header_pe.e_lfanew()?;
    match header_pe.get_valid_mut_nt_headers()? {
        NTHeadersMut::NTHeaders32(mut h) => {
            h.file_header.number_of_sections = sections.len() as u16;
            header_pe.write_val(e_lfanew.0 as usize, &h)?;
        }
        NTHeadersMut::NTHeaders64(mut h) => {
            h.file_header.number_of_sections = sections.len() as u16;
            header_pe.write_val(e_lfanew.0 as usize, &h)?;
        }
    }

    let table_offset = header_pe.get_section_table_offset()?.0 as usize;
    let table_end = table_offset + sections.len() * std::mem::size_of::<ImageSectionHeader>();
    if table_end > size_of_headers as usize {
        return Err(ProtectError::InvalidHostPe(
            "no header room left for new section table entries".into(),
        ));
    }

    let mut raw_cursor = align_up(size_of_headers, file_alignment);
    let mut va_cursor = 0u32;
    let mut headers = Vec::with_capacity(sections.len());

    for section in &sections {
        let mut header = *section.header();
        let data_len = section.data().len() as u32;

        header.size_of_raw_data = align_up(data_len, file_alignment);
        if header.virtual_size < data_len {
            header.virtual_size = data_len;
        }
        header.pointer_to_raw_data = exe::Offset(if data_len == 0 { 0 } else { raw_cursor });
        if header.virtual_address.0 == 0 {
            header.virtual_address = RVA(align_up(va_cursor, section_alignment));
        }

        va_cursor = header.virtual_address.0
            + header.virtual_size.max(header.size_of_raw_data).max(1);
        raw_cursor += header.size_of_raw_data;
        headers.push(header);
    }

    let size_of_image = align_up(va_cursor, section_alignment);

    {
        let table = header_pe.get_mut_section_table()?;
        table.copy_from_slice(&headers);
    }
    match header_pe.get_valid_mut_nt_headers()? {
        NTHeadersMut::NTHeaders32(mut h) => {
            h.optional_header.size_of_image = size_of_image;
            header_pe.write_val(e_lfanew.0 as usize, &h)?;
        }
        NTHeadersMut::NTHeaders64(mut h) => {
            h.optional_header.size_of_image = size_of_image;
            header_pe.write_val(e_lfanew.0 as usize, &h)?;
        }
    }

    let mut output = header_pe.as_slice().to_vec();
    output.resize(align_up(size_of_headers, file_alignment) as usize, 0);

    for (header, section) in headers.iter().zip(sections.iter()) {
        if header.size_of_raw_data == 0 {
            continue;
        }
        let start = header.pointer_to_raw_data.0 as usize;
        output.resize(start, 0);
        output.extend_from_slice(section.data());
        output.resize(start + header.size_of_raw_data as usize, 0);
    }

    PeImage::parse(&output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert_eq!(align_up(0, 0x200), 0);
        assert_eq!(align_up(1, 0x200), 0x200);
        assert_eq!(align_up(0x200, 0x200), 0x200);
        assert_eq!(align_down(0x1FF, 0x200), 0);
        assert_eq!(align_down(0x1234, 0x1000), 0x1000);
    }

    #[test]
    fn test_relocation_entry_packing() {
        let entry = RelocationEntry::new(IMAGE_REL_BASED_DIR64, 0xABC);
        assert_eq!(entry.0, 0xAABC);
        assert_eq!(entry.reloc_type(), IMAGE_REL_BASED_DIR64);
        assert_eq!(entry.page_offset(), 0xABC);

        let padding = RelocationEntry::new(IMAGE_REL_BASED_ABSOLUTE, 0);
        assert_eq!(padding.0, 0);
    }
}
