mod common;

use common::*;
use exe::ImageDirectoryEntry;
use protector::pe::PeImage;
use protector::protector::{protect, ProtectOptions};

const HIGHLOW: u8 = 3;
const DIR64: u8 = 10;

/// Structural checks over the output's base relocation table: blocks are
/// page aligned, 32-bit aligned (even entry counts) and exactly fill the
/// directory size.
fn check_reloc_blocks(pe: &PeImage) {
    let (dir_rva, dir_size) = pe.data_directory(ImageDirectoryEntry::BaseReloc).unwrap();
    let mut offset = pe.rva_to_file_offset(dir_rva).unwrap();
    let end = offset + dir_size as usize;

    while offset < end {
        let page = pe.read_u32(offset).unwrap();
        let size_of_block = pe.read_u32(offset + 4).unwrap();
        assert!(size_of_block >= 8, "degenerate relocation block");
        assert_eq!(size_of_block % 4, 0, "odd entry count in block 0x{:X}", page);
        assert_eq!(page % 0x1000, 0, "unaligned block page 0x{:X}", page);
        offset += size_of_block as usize;
    }
    assert_eq!(offset, end);
}

#[test]
fn test_straight_line_function_virtualized() {
    // push ebp; mov ebp, esp; add ebx, eax; pop ebp; ret
    let text = [0x55, 0x89, 0xE5, 0x01, 0xC3, 0x5D, 0xC3];
    let host = build_host_pe(false, &text, &[]);
    let interpreter = build_interpreter_dll(false);

    let protected = protect(
        PeImage::parse(&host).unwrap(),
        &interpreter,
        &ProtectOptions::default(),
    )
    .unwrap();

    let text_header = protected.section_by_name(".text").unwrap();
    let vm_loader = protected.section_by_name(".vmldr").unwrap();
    let vm_code = protected.section_by_name(".vmcode").unwrap();

    let raw = text_header.pointer_to_raw_data.0 as usize;
    let data = protected.data();

    // The add at 0x1003 was replaced with a near jump...
    assert_eq!(data[raw + 3], 0xE9);

    // ...whose displacement lands inside the VM loader section.
    let displacement = i32::from_le_bytes(data[raw + 4..raw + 8].try_into().unwrap());
    let target = (0x1003u32 + 5).wrapping_add(displacement as u32);
    let loader_begin = vm_loader.virtual_address.0;
    let loader_end = loader_begin + vm_loader.virtual_size.max(vm_loader.size_of_raw_data);
    assert!(
        target >= loader_begin && target < loader_end,
        "jump target 0x{:X} outside the loader section",
        target
    );

    // Loader section holds the interpreter copy plus the stubs;
    // bytecode landed in the virtualized-code section.
    assert!(vm_loader.size_of_raw_data > 0x200);
    assert!(vm_code.virtual_size > 0);

    // No TLS directory when the feature is off.
    let (tls_rva, tls_size) = protected
        .data_directory(ImageDirectoryEntry::TLS)
        .unwrap();
    assert_eq!((tls_rva, tls_size), (0, 0));

    // The interpreter's internal relocations resurface against the
    // final loader address, exactly once each.
    let relocations = collect_relocations(&protected);
    for offset in INTERPRETER_RELOC_OFFSETS {
        let expected = loader_begin + offset;
        assert_eq!(
            relocations
                .iter()
                .filter(|&&(_, rva, reloc_type)| rva == expected && reloc_type == HIGHLOW)
                .count(),
            1
        );
    }

    // One virtualized instruction -> one stub with a relocated image
    // base slot, plus the two interpreter entries.
    let in_loader = relocations
        .iter()
        .filter(|&&(_, rva, reloc_type)| {
            reloc_type == HIGHLOW && rva >= loader_begin && rva < loader_end
        })
        .count();
    assert_eq!(in_loader, 3);

    check_reloc_blocks(&protected);
}

#[test]
fn test_relocation_rollback_on_invalid_instruction() {
    let mut text = vec![0u8; 0x60];
    // 0x1000: call 0x1006 (a bogus target inside the mov's immediate)
    text[0..5].copy_from_slice(&[0xE8, 0x01, 0x00, 0x00, 0x00]);
    // 0x1005: mov eax, 0x00401044 -- relocation at 0x1006, virtualized
    text[5..10].copy_from_slice(&[0xB8, 0x44, 0x10, 0x40, 0x00]);
    // 0x100A: jmp [ecx*4 + 0x401006] -- marks [0x1006, 0x100A) as data
    text[10..17].copy_from_slice(&[0xFF, 0x24, 0x8D, 0x06, 0x10, 0x40, 0x00]);

    let host = build_host_pe(false, &text, &[0x006]);
    let interpreter = build_interpreter_dll(false);

    let protected = protect(
        PeImage::parse(&host).unwrap(),
        &interpreter,
        &ProtectOptions::default(),
    )
    .unwrap();

    // The byte the rollback restored is the original immediate byte.
    let text_header = protected.section_by_name(".text").unwrap();
    let raw = text_header.pointer_to_raw_data.0 as usize;
    assert_eq!(protected.data()[raw + 6], 0x44);

    // The relocation at 0x1006 survived: the rollback pulled it back out
    // of the removal list before the table was serialized.
    let relocations = collect_relocations(&protected);
    assert_eq!(
        relocations
            .iter()
            .filter(|&&(_, rva, reloc_type)| rva == 0x1006 && reloc_type == HIGHLOW)
            .count(),
        1
    );

    check_reloc_blocks(&protected);
}

#[test]
fn test_tls_synthesis_on_pe_without_tls() {
    // mov rax, 1; ret
    let text = [0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00, 0xC3];
    let host = build_host_pe(true, &text, &[]);
    let interpreter = build_interpreter_dll(true);

    let options = ProtectOptions {
        tls_callbacks: true,
        scan_function_pointers: false,
    };
    let protected = protect(PeImage::parse(&host).unwrap(), &interpreter, &options).unwrap();

    let vm_loader = protected.section_by_name(".vmldr").unwrap();
    let vm_code = protected.section_by_name(".vmcode").unwrap();
    let vm_code_va = vm_code.virtual_address.0;
    let default_base = 0x1_4000_0000u64;

    // Directory layout inside the virtualized-code section: index cell
    // at 0, callback list at 0x200, the directory itself at 0x400.
    let (tls_rva, tls_size) = protected
        .data_directory(ImageDirectoryEntry::TLS)
        .unwrap();
    assert_eq!(tls_size, 40);
    assert_eq!(tls_rva, vm_code_va + 0x400);

    let directory_offset = protected.rva_to_file_offset(tls_rva).unwrap();
    let address_of_index = protected.read_u64(directory_offset + 16).unwrap();
    let address_of_callbacks = protected.read_u64(directory_offset + 24).unwrap();
    assert_eq!(address_of_index, default_base + vm_code_va as u64);
    assert_eq!(address_of_callbacks, default_base + vm_code_va as u64 + 0x200);

    // First callback slot points at the interpreter's TlsCallback
    // inside the VM loader section.
    let list_offset = protected.rva_to_file_offset(vm_code_va + 0x200).unwrap();
    let first_callback = protected.read_u64(list_offset).unwrap();
    let callback_rva = (first_callback - default_base) as u32;
    assert_eq!(
        callback_rva,
        vm_loader.virtual_address.0 + INTERPRETER_TLS_CALLBACK_OFFSET
    );

    // Exactly three DIR64 entries cover the virtualized-code section:
    // the callback slot and the directory's two address fields.
    let relocations = collect_relocations(&protected);
    let vm_code_end = vm_code_va + vm_code.virtual_size.max(vm_code.size_of_raw_data);
    let mut in_vm_code: Vec<u32> = relocations
        .iter()
        .filter(|&&(_, rva, reloc_type)| {
            reloc_type == DIR64 && rva >= vm_code_va && rva < vm_code_end
        })
        .map(|&(_, rva, _)| rva - vm_code_va)
        .collect();
    in_vm_code.sort_unstable();
    assert_eq!(in_vm_code, vec![0x200, 0x410, 0x418]);

    check_reloc_blocks(&protected);
}
