use std::cell::RefCell;
use std::time::Instant;

use exe::{Arch, Buffer, SectionCharacteristics, VecPE};
use iced_x86::RflagsBits;
use logger::{debug, info, warn};
use rand::Rng;

use crate::disassembler::DisassemblyEngine;
use crate::error::ProtectError;
use crate::fixups::{self, Fixup, FixupContext, FixupOperation, OffsetRelativeTo};
use crate::interpreter::Interpreter;
use crate::pe::{self, PeImage};
use crate::relocs::RelocationIndex;
use crate::section::Section;
use crate::shellcode;
use crate::virtualizer;

/// Section holding the interpreter copy plus the per-instruction loader
/// stubs.
pub const VM_LOADER_SECTION_NAME: &str = ".vmldr";
/// Section holding the emitted bytecode (and TLS data when enabled).
pub const VM_CODE_SECTION_NAME: &str = ".vmcode";

const JMP_INSTRUCTION_SIZE: u32 = 5;
const CALL_INSTRUCTION_SIZE: u32 = 5;
const JMP_OPCODE: u8 = 0xE9;

/// Placeholder base used for values that become real virtual addresses
/// only after relocation.
pub fn default_pe_base_address(arch: Arch) -> u64 {
    match arch {
        Arch::X86 => 0x0040_0000,
        Arch::X64 => 0x1_4000_0000,
    }
}

#[derive(Default)]
pub struct ProtectOptions {
    pub tls_callbacks: bool,
    pub scan_function_pointers: bool,
}

/// State threaded through one protection run.
pub struct ProtectorContext {
    pub vm_loader_section: Section,
    pub virtualized_code_section: Section,
    pub new_text_section: Section,
    pub fixup_context: FixupContext,
}

/// Runs the whole pass: discovers code, virtualizes what the interpreter
/// can carry, patches `.text`, assembles the output PE and resolves the
/// deferred fixups.
pub fn protect(
    mut original_pe: PeImage,
    interpreter_data: &[u8],
    options: &ProtectOptions,
) -> Result<PeImage, ProtectError> {
    let arch = original_pe.arch();
    let image_base = original_pe.image_base();
    let section_alignment = original_pe.section_alignment();
    let file_alignment = original_pe.file_alignment();

    let mut interpreter = Interpreter::load(interpreter_data, arch)?;

    // The interpreter carries relocated absolute pointers (switch
    // tables). Rebase them onto the host image base minus the section's
    // own RVA; the missing loader-section RVA is added back by fixups.
    interpreter.prerelocate(image_base)?;

    let original_text_header = original_pe
        .section_by_name(".text")
        .map_err(|_| ProtectError::MissingSection(".text"))?;
    let original_text_copy = original_pe.copy_section_data(&original_text_header)?;
    let text_virtual_address = original_text_header.virtual_address.0;

    let mut vm_loader_section = Section::new(
        VM_LOADER_SECTION_NAME,
        SectionCharacteristics::MEM_EXECUTE
            | SectionCharacteristics::MEM_READ
            | SectionCharacteristics::MEM_DISCARDABLE,
    );
    vm_loader_section.append(
        &interpreter.vm_section_data()?,
        section_alignment,
        file_alignment,
    );

    let virtualized_code_section = Section::new(
        VM_CODE_SECTION_NAME,
        SectionCharacteristics::MEM_READ
            | SectionCharacteristics::MEM_DISCARDABLE
            | SectionCharacteristics::MEM_EXECUTE
            | SectionCharacteristics::MEM_WRITE,
    );

    let context = RefCell::new(ProtectorContext {
        vm_loader_section,
        virtualized_code_section,
        new_text_section: Section::from_existing(
            original_text_header,
            original_text_copy.clone(),
        ),
        fixup_context: FixupContext::default(),
    });

    if options.tls_callbacks {
        let mut ctx = context.borrow_mut();
        let ProtectorContext {
            virtualized_code_section,
            fixup_context,
            ..
        } = &mut *ctx;
        fixups::install_tls_callbacks(
            &mut original_pe,
            &interpreter,
            virtualized_code_section,
            fixup_context,
        )?;
    }

    interpreter.seed_relocation_fixups(&mut context.borrow_mut().fixup_context)?;

    let relocation_index = RelocationIndex::from_pe(&original_pe)?;
    let interpreter_function_offset = interpreter.function_offset;

    let started = Instant::now();
    let mut total_disassembled = 0u32;
    let mut total_virtualized = 0u32;
    let mut rng = rand::thread_rng();

    {
        let mut engine = DisassemblyEngine::new(&original_pe, options.scan_function_pointers)?;

        engine.disassemble_from_entrypoint(
            |instruction| {
                total_disassembled += 1;

                let Some(vm_opcode) = virtualizer::vm_opcode(instruction) else {
                    return Ok(());
                };

                if instruction.rflags_modified() != RflagsBits::NONE
                    && !vm_opcode.emulates_eflags()
                {
                    return Err(ProtectError::UnsupportedInstruction(instruction.ip()));
                }

                // The jump patch needs five bytes from the instruction
                // start; skip anything cut off by the section end.
                let text_offset =
                    (instruction.ip() as u32 - text_virtual_address) as usize;
                let patch_end = text_offset + instruction.len().max(5);
                if patch_end > original_text_copy.len() {
                    return Ok(());
                }

                let relocations =
                    relocation_index.within_instruction(instruction.ip(), instruction.len());

                let encryption_key = rng.gen_range(1000..=10_000_000u32);
                let bytecode = virtualizer::virtualized_code(
                    instruction,
                    vm_opcode,
                    encryption_key,
                    &relocations,
                );
                if bytecode.is_empty() {
                    return Ok(());
                }

                let mut ctx = context.borrow_mut();

                let virtualized_code_offset = ctx.virtualized_code_section.append(
                    &bytecode,
                    section_alignment,
                    file_alignment,
                );

                let mut loader = virtualizer::loader_shellcode(arch, image_base);
                loader.modify_u32(shellcode::VM_OPCODE_ENCRYPTION_KEY, encryption_key)?;
                match arch {
                    Arch::X86 => {
                        loader.modify_u32(shellcode::VM_CODE_ADDR, virtualized_code_offset)?
                    }
                    Arch::X64 => loader
                        .modify_u64(shellcode::VM_CODE_ADDR, virtualized_code_offset as u64)?,
                }

                let loader_offset_before = ctx.vm_loader_section.current_offset();

                // PC-relative call into the interpreter copy living in
                // the same section; no fixup needed.
                let core_slot = loader.named_value_offset(shellcode::VM_CORE_FUNCTION)?;
                loader.modify_u32(
                    shellcode::VM_CORE_FUNCTION,
                    interpreter_function_offset
                        .wrapping_sub(loader_offset_before)
                        .wrapping_sub(CALL_INSTRUCTION_SIZE)
                        .wrapping_sub(core_slot)
                        .wrapping_add(1),
                )?;

                let orig_slot = loader.named_value_offset(shellcode::ORIG_ADDR)?;
                let destination = (instruction.ip() + instruction.len() as u64) as u32;
                let origin = loader_offset_before + orig_slot;
                loader.modify_u32(
                    shellcode::ORIG_ADDR,
                    destination
                        .wrapping_sub(origin)
                        .wrapping_sub(JMP_INSTRUCTION_SIZE)
                        .wrapping_add(1),
                )?;

                let loader_offset = ctx.vm_loader_section.append(
                    loader.buffer(),
                    section_alignment,
                    file_alignment,
                );

                ctx.fixup_context.fixups.push(Fixup {
                    offset: loader_offset + orig_slot,
                    offset_type: OffsetRelativeTo::VmLoader,
                    op: FixupOperation::SubtractVmLoaderVa,
                    size: 4,
                });

                let vm_code_slot = loader.named_value_offset(shellcode::VM_CODE_ADDR)?;
                ctx.fixup_context.fixups.push(Fixup {
                    offset: loader_offset + vm_code_slot,
                    offset_type: OffsetRelativeTo::VmLoader,
                    op: FixupOperation::AddVirtualizedCodeVa,
                    size: 4,
                });

                // The loader reads the live image base through the
                // standard relocation machinery.
                let image_base_slot = loader.named_value_offset(shellcode::IMAGE_BASE)?;
                ctx.fixup_context
                    .vm_section_offsets_to_relocate
                    .push(loader_offset + image_base_slot);

                let instruction_len = instruction.len();
                let text_data = ctx.new_text_section.data_mut();
                for byte in &mut text_data[text_offset..text_offset + instruction_len] {
                    *byte = rng.gen::<u8>();
                }
                text_data[text_offset] = JMP_OPCODE;
                let displacement = loader_offset
                    .wrapping_sub(instruction.ip() as u32)
                    .wrapping_sub(JMP_INSTRUCTION_SIZE);
                text_data[text_offset + 1..text_offset + 5]
                    .copy_from_slice(&displacement.to_le_bytes());

                ctx.fixup_context.fixups.push(Fixup {
                    offset: text_offset as u32 + 1,
                    offset_type: OffsetRelativeTo::Text,
                    op: FixupOperation::AddVmLoaderVa,
                    size: 4,
                });

                for &rva in &relocations {
                    ctx.fixup_context.reloc_rvas_to_remove.push(rva);
                }

                total_virtualized += 1;
                debug!(
                    "Virtualized 0x{:08X} {:?}",
                    instruction.ip(),
                    instruction.mnemonic()
                );

                Ok(())
            },
            |address, size| {
                warn!("Resetting invalid instruction 0x{:08X}", address);

                let mut ctx = context.borrow_mut();

                let text_offset = (address as u32 - text_virtual_address) as usize;
                let end = (text_offset + size).min(original_text_copy.len());
                if text_offset < end {
                    ctx.new_text_section.data_mut()[text_offset..end]
                        .copy_from_slice(&original_text_copy[text_offset..end]);
                }

                // Restore the relocations the patch had claimed.
                for rva in relocation_index.within_instruction(address, size) {
                    if let Some(found) = ctx
                        .fixup_context
                        .reloc_rvas_to_remove
                        .iter()
                        .position(|&r| r == rva)
                    {
                        ctx.fixup_context.reloc_rvas_to_remove.remove(found);
                    }
                }
            },
        )?;
    }

    let mut context = context.into_inner();

    debug_assert_eq!(
        context.new_text_section.data().len(),
        original_text_copy.len()
    );

    // Neutralize before assembling so the serialized table reflects the
    // net set; the new sections' own relocations are appended afterwards
    // with unfixed RVAs and must not be touched here.
    original_pe.remove_relocations(&context.fixup_context.reloc_rvas_to_remove)?;

    let mut new_pe = assemble_new_pe(&original_pe, &mut context)?;

    fixups::resolve(
        &mut new_pe,
        &original_text_header,
        &context.fixup_context.fixups,
    )?;

    info!(
        "Disassembled {} instructions, virtualized {}",
        total_disassembled, total_virtualized
    );
    info!(
        "Time spent: {:.2} ms",
        started.elapsed().as_secs_f64() * 1000.0
    );

    Ok(new_pe)
}

/// Rebuilds the output: original sections with the patched `.text`, the
/// grown `.reloc`, then the two new sections at the end.
fn assemble_new_pe(
    original_pe: &PeImage,
    context: &mut ProtectorContext,
) -> Result<PeImage, ProtectError> {
    let arch = original_pe.arch();
    let section_alignment = original_pe.section_alignment();
    let file_alignment = original_pe.file_alignment();

    let mut new_sections = Vec::new();
    for header in original_pe.section_table()? {
        let data = original_pe.copy_section_data(&header)?;
        let mut section = Section::from_existing(header, data);
        if section.name() == ".text" {
            section = context.new_text_section.clone();
        }
        new_sections.push(section);
    }

    // Only a trailing .reloc can grow without moving other sections.
    match new_sections.last() {
        Some(last) if last.name() == ".reloc" => {}
        _ => {
            return Err(ProtectError::InvalidHostPe(
                ".reloc must be the last section".into(),
            ))
        }
    }

    let header_data = original_pe.header_data()?;
    let mut header_pe = VecPE::from_disk_data(&header_data);

    {
        let reloc_section = new_sections.last_mut().unwrap();
        fixups::add_vm_section_relocations(
            &mut header_pe,
            arch,
            reloc_section,
            &mut context.fixup_context,
            section_alignment,
            file_alignment,
        )?;
        fixups::add_virtualized_code_section_relocations(
            &mut header_pe,
            arch,
            reloc_section,
            &mut context.fixup_context,
            section_alignment,
            file_alignment,
        )?;
    }

    new_sections.push(context.vm_loader_section.clone());
    new_sections.push(context.virtualized_code_section.clone());

    pe::build(header_pe.as_slice().to_vec(), new_sections)
}
