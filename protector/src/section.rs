use exe::{ImageSectionHeader, SectionCharacteristics};

use crate::pe::align_up;

/// Growable in-memory section. The payload is kept padded to the file
/// alignment so that every append lands on an aligned offset; the
/// virtual size tracks the logical (unpadded) length.
#[derive(Clone)]
pub struct Section {
    header: ImageSectionHeader,
    data: Vec<u8>,
    virtual_size: u32,
}

impl Section {
    pub fn new(name: &str, characteristics: SectionCharacteristics) -> Self {
        let mut header = ImageSectionHeader::default();
        header.set_name(Some(name));
        header.characteristics = characteristics;

        Self {
            header,
            data: Vec::new(),
            virtual_size: 0,
        }
    }

    /// Wraps an existing section header together with a deep copy of its
    /// raw payload.
    pub fn from_existing(header: ImageSectionHeader, data: Vec<u8>) -> Self {
        let virtual_size = header.virtual_size;
        Self {
            header,
            data,
            virtual_size,
        }
    }

    pub fn name(&self) -> String {
        let bytes = self.header.name.iter().map(|c| c.0).collect::<Vec<u8>>();
        String::from_utf8_lossy(&bytes)
            .trim_end_matches('\0')
            .to_string()
    }

    pub fn header(&self) -> &ImageSectionHeader {
        &self.header
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn virtual_size(&self) -> u32 {
        self.virtual_size
    }

    /// Offset at which the next append will be placed.
    pub fn current_offset(&self) -> u32 {
        self.data.len() as u32
    }

    /// Appends `bytes`, returning the section-relative offset of the
    /// first byte written, then zero-pads so the next append starts at a
    /// file-aligned offset.
    pub fn append(&mut self, bytes: &[u8], section_alignment: u32, file_alignment: u32) -> u32 {
        debug_assert!(section_alignment.is_power_of_two());
        debug_assert!(file_alignment.is_power_of_two());

        let offset = self.data.len() as u32;

        self.data.extend_from_slice(bytes);
        self.virtual_size = self.data.len() as u32;
        self.header.virtual_size = self.virtual_size;

        let padded = align_up(self.data.len() as u32, file_alignment);
        self.data.resize(padded as usize, 0);

        offset
    }

    /// Drops everything past `len`, removing previously appended padding.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.virtual_size = self.data.len() as u32;
        self.header.virtual_size = self.virtual_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_returns_placement_offset() {
        let mut section = Section::new(".test", SectionCharacteristics::MEM_READ);

        let first = section.append(&[1, 2, 3], 0x1000, 0x200);
        assert_eq!(first, 0);
        assert_eq!(section.data().len(), 0x200);
        assert_eq!(section.virtual_size(), 3);

        let second = section.append(&[4; 0x201], 0x1000, 0x200);
        assert_eq!(second, 0x200);
        assert_eq!(section.data().len(), 0x600);
        assert_eq!(section.virtual_size(), 0x401);
        assert_eq!(section.current_offset(), 0x600);
    }

    #[test]
    fn test_truncate_reopens_unaligned_tail() {
        let mut section = Section::new(".reloc", SectionCharacteristics::MEM_READ);
        section.append(&[0xAA; 0x10], 0x1000, 0x200);

        section.truncate(0xC);
        assert_eq!(section.current_offset(), 0xC);

        let offset = section.append(&[0xBB; 4], 0x1000, 0x200);
        assert_eq!(offset, 0xC);
        assert_eq!(&section.data()[0xC..0x10], &[0xBB; 4]);
    }

    #[test]
    fn test_section_name_round_trip() {
        let section = Section::new(".vmldr", SectionCharacteristics::MEM_EXECUTE);
        assert_eq!(section.name(), ".vmldr");
    }
}
