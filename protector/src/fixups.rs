use exe::{Arch, ImageDirectoryEntry, ImageSectionHeader, VecPE, PE};

use crate::error::ProtectError;
use crate::interpreter::Interpreter;
use crate::pe::{
    self, align_down, PeImage, RelocationEntry, IMAGE_REL_BASED_ABSOLUTE, IMAGE_REL_BASED_DIR64,
    IMAGE_REL_BASED_HIGHLOW,
};
use crate::protector::{default_pe_base_address, VM_CODE_SECTION_NAME, VM_LOADER_SECTION_NAME};
use crate::section::Section;

const IMAGE_SCN_ALIGN_1BYTES: u32 = 0x0010_0000;
const PAGE_SIZE: u32 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupOperation {
    AddVmLoaderVa,
    AddVirtualizedCodeVa,
    SubtractVmLoaderVa,
}

/// Which base the fixup offset is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetRelativeTo {
    VmLoader,
    Text,
    Reloc,
    VirtualizedCode,
    /// A plain file offset, used for values inside the headers.
    Absolute,
}

/// A deferred patch, resolved once every section has its final virtual
/// address.
#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    pub offset: u32,
    pub offset_type: OffsetRelativeTo,
    pub op: FixupOperation,
    pub size: u8,
}

#[derive(Default)]
pub struct FixupContext {
    pub fixups: Vec<Fixup>,
    /// Host relocation RVAs neutralized because their instruction was
    /// replaced. Entries can be taken back out by the rollback path.
    pub reloc_rvas_to_remove: Vec<u64>,
    /// VM loader section offsets that hold absolute addresses and need
    /// entries in the output `.reloc`.
    pub vm_section_offsets_to_relocate: Vec<u32>,
    pub virtualized_code_section_offsets_to_relocate: Vec<u32>,
}

fn pointer_size(arch: Arch) -> usize {
    match arch {
        Arch::X86 => 4,
        Arch::X64 => 8,
    }
}

/// `(directory size, AddressOfIndex offset, AddressOfCallBacks offset)`
/// of `IMAGE_TLS_DIRECTORY` for the given bitness.
fn tls_directory_layout(arch: Arch) -> (u32, usize, usize) {
    match arch {
        Arch::X86 => (24, 8, 12),
        Arch::X64 => (40, 16, 24),
    }
}

fn read_pointer(pe: &PeImage, offset: usize, arch: Arch) -> Result<u64, ProtectError> {
    match arch {
        Arch::X86 => Ok(pe.read_u32(offset)? as u64),
        Arch::X64 => pe.read_u64(offset),
    }
}

fn write_pointer(
    pe: &mut PeImage,
    offset: usize,
    value: u64,
    arch: Arch,
) -> Result<(), ProtectError> {
    match arch {
        Arch::X86 => pe.write_u32(offset, value as u32),
        Arch::X64 => pe.write_u64(offset, value),
    }
}

fn serialize_va_list(values: &[u64], arch: Arch) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * pointer_size(arch));
    for &value in values {
        match arch {
            Arch::X86 => bytes.extend_from_slice(&(value as u32).to_le_bytes()),
            Arch::X64 => bytes.extend_from_slice(&value.to_le_bytes()),
        }
    }
    bytes
}

/// Appends the callback VA list to the virtualized-code section and
/// registers relocations for every live slot plus a fixup that binds the
/// interpreter's callback to the final VM loader address. Returns the
/// list's section offset.
fn append_callback_list(
    callbacks: &[u64],
    interpreter_callback_index: usize,
    arch: Arch,
    section_alignment: u32,
    file_alignment: u32,
    virtualized_code_section: &mut Section,
    context: &mut FixupContext,
) -> u32 {
    let stride = pointer_size(arch);
    let bytes = serialize_va_list(callbacks, arch);
    let list_offset = virtualized_code_section.append(&bytes, section_alignment, file_alignment);

    for (i, &value) in callbacks.iter().enumerate() {
        if value != 0 {
            context
                .virtualized_code_section_offsets_to_relocate
                .push(list_offset + (i * stride) as u32);
        }
    }

    context.fixups.push(Fixup {
        offset: list_offset + (interpreter_callback_index * stride) as u32,
        offset_type: OffsetRelativeTo::VirtualizedCode,
        op: FixupOperation::AddVmLoaderVa,
        size: stride as u8,
    });

    list_offset
}

/// Installs the interpreter's `TlsCallback` so it runs before the host
/// entrypoint. A host that already has a TLS directory keeps it and only
/// gets its callback list moved; otherwise a whole directory is
/// synthesized inside the virtualized-code section.
pub fn install_tls_callbacks(
    pe: &mut PeImage,
    interpreter: &Interpreter,
    virtualized_code_section: &mut Section,
    context: &mut FixupContext,
) -> Result<(), ProtectError> {
    let arch = pe.arch();
    let stride = pointer_size(arch);
    let (directory_size, index_field, callbacks_field) = tls_directory_layout(arch);
    let default_base = default_pe_base_address(arch);
    let section_alignment = pe.section_alignment();
    let file_alignment = pe.file_alignment();

    let (tls_rva, tls_size) = pe.data_directory(ImageDirectoryEntry::TLS)?;
    let interpreter_callback_va = default_base + interpreter.tls_callback_offset as u64;

    if tls_size != 0 {
        if tls_size != directory_size {
            return Err(ProtectError::InvalidHostPe(format!(
                "unexpected tls directory size {}",
                tls_size
            )));
        }

        let tls_offset = pe.rva_to_file_offset(tls_rva)?;
        let address_of_callbacks = read_pointer(pe, tls_offset + callbacks_field, arch)?;

        let mut callbacks = Vec::new();
        if address_of_callbacks != 0 {
            let list_rva = address_of_callbacks.wrapping_sub(pe.image_base()) as u32;
            let mut offset = pe.rva_to_file_offset(list_rva)?;
            loop {
                let value = read_pointer(pe, offset, arch)?;
                if value == 0 {
                    break;
                }
                callbacks.push(value);
                offset += stride;
            }
        }

        let interpreter_callback_index = callbacks.len();
        callbacks.push(interpreter_callback_va);
        callbacks.extend_from_slice(&[0u64; 5]);

        let list_offset = append_callback_list(
            &callbacks,
            interpreter_callback_index,
            arch,
            section_alignment,
            file_alignment,
            virtualized_code_section,
            context,
        );

        write_pointer(
            pe,
            tls_offset + callbacks_field,
            default_base + list_offset as u64,
            arch,
        )?;
        context.fixups.push(Fixup {
            offset: (tls_offset + callbacks_field) as u32,
            offset_type: OffsetRelativeTo::Absolute,
            op: FixupOperation::AddVirtualizedCodeVa,
            size: stride as u8,
        });
    } else {
        // Zeroed cell the loader uses as the TLS index.
        let index_cell = vec![0u8; stride];
        let index_data_offset =
            virtualized_code_section.append(&index_cell, section_alignment, file_alignment);

        let mut callbacks = vec![interpreter_callback_va];
        callbacks.extend_from_slice(&[0u64; 5]);

        let list_offset = append_callback_list(
            &callbacks,
            0,
            arch,
            section_alignment,
            file_alignment,
            virtualized_code_section,
            context,
        );

        let mut directory = Vec::with_capacity(directory_size as usize);
        // StartAddressOfRawData / EndAddressOfRawData stay empty.
        directory.extend_from_slice(&serialize_va_list(&[0, 0], arch));
        directory.extend_from_slice(&serialize_va_list(
            &[default_base + index_data_offset as u64],
            arch,
        ));
        directory.extend_from_slice(&serialize_va_list(
            &[default_base + list_offset as u64],
            arch,
        ));
        directory.extend_from_slice(&0u32.to_le_bytes()); // SizeOfZeroFill
        directory.extend_from_slice(&IMAGE_SCN_ALIGN_1BYTES.to_le_bytes());

        let directory_offset =
            virtualized_code_section.append(&directory, section_alignment, file_alignment);

        let address_of_index_offset = directory_offset + index_field as u32;
        context.fixups.push(Fixup {
            offset: address_of_index_offset,
            offset_type: OffsetRelativeTo::VirtualizedCode,
            op: FixupOperation::AddVirtualizedCodeVa,
            size: stride as u8,
        });
        context
            .virtualized_code_section_offsets_to_relocate
            .push(address_of_index_offset);

        let address_of_callbacks_offset = directory_offset + callbacks_field as u32;
        context.fixups.push(Fixup {
            offset: address_of_callbacks_offset,
            offset_type: OffsetRelativeTo::VirtualizedCode,
            op: FixupOperation::AddVirtualizedCodeVa,
            size: stride as u8,
        });
        context
            .virtualized_code_section_offsets_to_relocate
            .push(address_of_callbacks_offset);

        // The directory entry holds a section offset until the final
        // virtual address is known.
        pe.set_data_directory(ImageDirectoryEntry::TLS, directory_offset, directory_size)?;
        let entry_offset = pe.data_directory_entry_offset(ImageDirectoryEntry::TLS)?;
        context.fixups.push(Fixup {
            offset: entry_offset,
            offset_type: OffsetRelativeTo::Absolute,
            op: FixupOperation::AddVirtualizedCodeVa,
            size: 4,
        });
    }

    Ok(())
}

pub fn add_vm_section_relocations(
    header_pe: &mut VecPE,
    arch: Arch,
    reloc_section: &mut Section,
    context: &mut FixupContext,
    section_alignment: u32,
    file_alignment: u32,
) -> Result<(), ProtectError> {
    let mut offsets = context.vm_section_offsets_to_relocate.clone();
    offsets.sort_unstable();
    add_relocations(
        header_pe,
        arch,
        reloc_section,
        &offsets,
        FixupOperation::AddVmLoaderVa,
        &mut context.fixups,
        section_alignment,
        file_alignment,
    )
}

pub fn add_virtualized_code_section_relocations(
    header_pe: &mut VecPE,
    arch: Arch,
    reloc_section: &mut Section,
    context: &mut FixupContext,
    section_alignment: u32,
    file_alignment: u32,
) -> Result<(), ProtectError> {
    let mut offsets = context.virtualized_code_section_offsets_to_relocate.clone();
    offsets.sort_unstable();
    add_relocations(
        header_pe,
        arch,
        reloc_section,
        &offsets,
        FixupOperation::AddVirtualizedCodeVa,
        &mut context.fixups,
        section_alignment,
        file_alignment,
    )
}

/// Synthesizes base relocation blocks for section offsets whose final
/// values are absolute addresses. Block virtual addresses are seeded
/// with the plain section offset (page aligned) and corrected by a fixup
/// once the section RVA is known.
#[allow(clippy::too_many_arguments)]
fn add_relocations(
    header_pe: &mut VecPE,
    arch: Arch,
    reloc_section: &mut Section,
    offsets: &[u32],
    op: FixupOperation,
    fixups: &mut Vec<Fixup>,
    section_alignment: u32,
    file_alignment: u32,
) -> Result<(), ProtectError> {
    if offsets.is_empty() {
        return Ok(());
    }
    if reloc_section.name() != ".reloc" {
        return Err(ProtectError::MissingSection(".reloc"));
    }

    let reloc_type = match arch {
        Arch::X86 => IMAGE_REL_BASED_HIGHLOW,
        Arch::X64 => IMAGE_REL_BASED_DIR64,
    };

    // Strip the original trailing padding so new blocks continue the
    // live relocation data.
    let directory_size = header_pe
        .get_data_directory(ImageDirectoryEntry::BaseReloc)?
        .size;
    reloc_section.truncate(directory_size as usize);

    let mut block_virtual_address = align_down(offsets[0], PAGE_SIZE);
    let mut entries: Vec<RelocationEntry> = Vec::new();

    for &offset in offsets {
        let mut delta = offset - block_virtual_address;

        if delta >= PAGE_SIZE {
            let block_offset = append_relocation_block(
                block_virtual_address,
                &mut entries,
                header_pe,
                reloc_section,
                section_alignment,
                file_alignment,
            )?;
            fixups.push(Fixup {
                offset: block_offset,
                offset_type: OffsetRelativeTo::Reloc,
                op,
                size: 4,
            });
            entries.clear();

            block_virtual_address = align_down(offset, PAGE_SIZE);
            delta = offset - block_virtual_address;
        }

        entries.push(RelocationEntry::new(reloc_type, delta as u16));
    }

    if !entries.is_empty() {
        let block_offset = append_relocation_block(
            block_virtual_address,
            &mut entries,
            header_pe,
            reloc_section,
            section_alignment,
            file_alignment,
        )?;
        fixups.push(Fixup {
            offset: block_offset,
            offset_type: OffsetRelativeTo::Reloc,
            op,
            size: 4,
        });
    }

    Ok(())
}

/// Serializes one `IMAGE_BASE_RELOCATION` block (padded to an even entry
/// count), appends it to `.reloc` and grows the base relocation data
/// directory accordingly. Returns the block's section offset.
fn append_relocation_block(
    block_virtual_address: u32,
    entries: &mut Vec<RelocationEntry>,
    header_pe: &mut VecPE,
    reloc_section: &mut Section,
    section_alignment: u32,
    file_alignment: u32,
) -> Result<u32, ProtectError> {
    if entries.len() % 2 != 0 {
        entries.push(RelocationEntry::new(IMAGE_REL_BASED_ABSOLUTE, 0));
    }

    let size_of_block = 8 + entries.len() as u32 * 2;
    let mut bytes = Vec::with_capacity(size_of_block as usize);
    bytes.extend_from_slice(&block_virtual_address.to_le_bytes());
    bytes.extend_from_slice(&size_of_block.to_le_bytes());
    for entry in entries.iter() {
        bytes.extend_from_slice(&entry.0.to_le_bytes());
    }

    let offset = reloc_section.append(&bytes, section_alignment, file_alignment);

    header_pe
        .get_mut_data_directory(ImageDirectoryEntry::BaseReloc)?
        .size += bytes.len() as u32;

    Ok(offset)
}

/// Resolves every deferred fixup against the assembled PE's final
/// section virtual addresses, then strips the anti-patching directories.
pub fn resolve(
    pe: &mut PeImage,
    text_section: &ImageSectionHeader,
    fixups: &[Fixup],
) -> Result<(), ProtectError> {
    let vm_loader = pe.section_by_name(VM_LOADER_SECTION_NAME)?;
    let virtualized_code = pe.section_by_name(VM_CODE_SECTION_NAME)?;
    let reloc = pe.section_by_name(".reloc")?;

    for fixup in fixups {
        let file_offset = match fixup.offset_type {
            OffsetRelativeTo::VmLoader => {
                pe.rva_to_file_offset(pe::section_offset_to_rva(&vm_loader, fixup.offset))?
            }
            OffsetRelativeTo::Text => {
                pe.rva_to_file_offset(pe::section_offset_to_rva(text_section, fixup.offset))?
            }
            OffsetRelativeTo::Reloc => {
                pe.rva_to_file_offset(pe::section_offset_to_rva(&reloc, fixup.offset))?
            }
            OffsetRelativeTo::VirtualizedCode => pe.rva_to_file_offset(
                pe::section_offset_to_rva(&virtualized_code, fixup.offset),
            )?,
            OffsetRelativeTo::Absolute => fixup.offset as usize,
        };

        let delta = match fixup.op {
            FixupOperation::AddVmLoaderVa => vm_loader.virtual_address.0 as u64,
            FixupOperation::AddVirtualizedCodeVa => virtualized_code.virtual_address.0 as u64,
            FixupOperation::SubtractVmLoaderVa => {
                (vm_loader.virtual_address.0 as u64).wrapping_neg()
            }
        };

        match fixup.size {
            4 => {
                let value = pe.read_u32(file_offset)?;
                pe.write_u32(file_offset, value.wrapping_add(delta as u32))?;
            }
            8 => {
                let value = pe.read_u64(file_offset)?;
                pe.write_u64(file_offset, value.wrapping_add(delta))?;
            }
            other => return Err(ProtectError::UnsupportedFixupSize(other)),
        }
    }

    // RTTI obfuscation would hook in at this point.
    pe.nullify_data_directory(ImageDirectoryEntry::LoadConfig)?;
    pe.nullify_data_directory(ImageDirectoryEntry::Debug)?;

    Ok(())
}
