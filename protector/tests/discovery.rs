mod common;

use std::collections::HashMap;

use common::*;
use protector::disassembler::DisassemblyEngine;
use protector::pe::PeImage;

fn run_engine(pe: &PeImage) -> (HashMap<u64, u32>, Vec<(u64, u64)>) {
    let mut engine = DisassemblyEngine::new(pe, false).unwrap();

    let mut deliveries: HashMap<u64, u32> = HashMap::new();
    engine
        .disassemble_from_entrypoint(
            |instruction| {
                *deliveries.entry(instruction.ip()).or_insert(0) += 1;
                Ok(())
            },
            |_, _| {},
        )
        .unwrap();

    let ranges = engine
        .data_ranges()
        .iter()
        .map(|range| (range.begin_address, range.end_address))
        .collect();

    (deliveries, ranges)
}

#[test]
fn test_conditional_branch_target_visited_once() {
    let mut text = vec![0u8; 0x20];
    // 0x1000: jnz 0x1010
    text[0] = 0x75;
    text[1] = 0x0E;
    // 0x1002: jmp 0x1010 (second edge to the same target)
    text[2] = 0xE9;
    text[3..7].copy_from_slice(&9u32.to_le_bytes());
    // 0x1010: ret
    text[0x10] = 0xC3;

    let host = build_host_pe(false, &text, &[]);
    let pe = PeImage::parse(&host).unwrap();
    let (deliveries, _) = run_engine(&pe);

    assert_eq!(deliveries.get(&0x1010), Some(&1));
    for (&rva, &count) in &deliveries {
        assert_eq!(count, 1, "instruction at 0x{:X} delivered {} times", rva, count);
    }
}

#[test]
fn test_x86_jump_table() {
    let mut text = vec![0u8; 0x60];
    // 0x1000: jmp dword ptr [ecx*4 + 0x401020]
    text[0..7].copy_from_slice(&[0xFF, 0x24, 0x8D, 0x20, 0x10, 0x40, 0x00]);
    // table at 0x1020: two live entries, a null terminator, one dead entry
    text[0x20..0x24].copy_from_slice(&0x0040_1030u32.to_le_bytes());
    text[0x24..0x28].copy_from_slice(&0x0040_1040u32.to_le_bytes());
    text[0x28..0x2C].copy_from_slice(&0u32.to_le_bytes());
    text[0x2C..0x30].copy_from_slice(&0x0040_1050u32.to_le_bytes());
    text[0x30] = 0xC3;
    text[0x40] = 0xC3;
    text[0x50] = 0xC3;

    let host = build_host_pe(false, &text, &[]);
    let pe = PeImage::parse(&host).unwrap();
    let (deliveries, ranges) = run_engine(&pe);

    assert_eq!(ranges, vec![(0x1020, 0x1028)]);
    assert!(deliveries.contains_key(&0x1030));
    assert!(deliveries.contains_key(&0x1040));
    assert!(!deliveries.contains_key(&0x1050));
}

fn x64_idiom_text(add: &[u8], jmp: &[u8]) -> Vec<u8> {
    let mut text = Vec::new();
    // 0x1000: mov eax, [rcx + rax*4 + 0x10F2F4]
    text.extend_from_slice(&[0x8B, 0x84, 0x81, 0xF4, 0xF2, 0x10, 0x00]);
    text.extend_from_slice(add);
    text.extend_from_slice(jmp);
    text.push(0xC3);
    text
}

#[test]
fn test_x64_jump_table_idiom_matches() {
    let text = x64_idiom_text(&[0x48, 0x01, 0xC8], &[0xFF, 0xE0]);
    let host = build_host_pe(true, &text, &[]);
    let pe = PeImage::parse(&host).unwrap();
    let (_, ranges) = run_engine(&pe);

    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].0, 0x10F2F4);
}

#[test]
fn test_x64_jump_table_rejects_mutations() {
    // sub instead of add
    let text = x64_idiom_text(&[0x48, 0x29, 0xC8], &[0xFF, 0xE0]);
    let host = build_host_pe(true, &text, &[]);
    let (_, ranges) = run_engine(&PeImage::parse(&host).unwrap());
    assert!(ranges.is_empty());

    // jmp through a register other than the add destination
    let text = x64_idiom_text(&[0x48, 0x01, 0xC8], &[0xFF, 0xE1]);
    let host = build_host_pe(true, &text, &[]);
    let (_, ranges) = run_engine(&PeImage::parse(&host).unwrap());
    assert!(ranges.is_empty());

    // index scale of 8 instead of 4
    let mut text = x64_idiom_text(&[0x48, 0x01, 0xC8], &[0xFF, 0xE0]);
    text[2] = 0xC1;
    let host = build_host_pe(true, &text, &[]);
    let (_, ranges) = run_engine(&PeImage::parse(&host).unwrap());
    assert!(ranges.is_empty());
}

#[test]
fn test_data_range_reported_even_when_bytes_do_not_decode() {
    let mut text = vec![0u8; 0x60];
    // 0x1000: call 0x1020 (a queued point landing inside the table)
    text[0..5].copy_from_slice(&[0xE8, 0x1B, 0x00, 0x00, 0x00]);
    // 0x1005: jmp dword ptr [ecx*4 + 0x401020]
    text[5..12].copy_from_slice(&[0xFF, 0x24, 0x8D, 0x20, 0x10, 0x40, 0x00]);
    // table entry at 0x1020 -> 0x0040108F; reinterpreted as code these
    // bytes (8F 10 40 00) do not decode to any instruction
    text[0x20..0x24].copy_from_slice(&0x0040_108Fu32.to_le_bytes());
    // terminator at 0x1024 stays zero

    let host = build_host_pe(false, &text, &[]);
    let pe = PeImage::parse(&host).unwrap();
    let mut engine = DisassemblyEngine::new(&pe, false).unwrap();

    let mut invalid_hits = Vec::new();
    engine
        .disassemble_from_entrypoint(
            |_| Ok(()),
            |address, size| invalid_hits.push((address, size)),
        )
        .unwrap();

    let ranges: Vec<(u64, u64)> = engine
        .data_ranges()
        .iter()
        .map(|range| (range.begin_address, range.end_address))
        .collect();
    assert_eq!(ranges, vec![(0x1020, 0x1024)]);

    // The queued point at 0x1020 must be reported as invalid, not
    // silently dropped on the failed decode.
    assert_eq!(invalid_hits.len(), 1);
    assert_eq!(invalid_hits[0].0, 0x1020);
}

#[test]
fn test_rva_file_offset_round_trip() {
    let host = build_host_pe(false, &[0xC3], &[]);
    let pe = PeImage::parse(&host).unwrap();

    for header in pe.section_table().unwrap() {
        let start = header.pointer_to_raw_data.0 as usize;
        let end = start + header.size_of_raw_data as usize;
        for probe in [start, start + 1, start + 0x1FF, end - 1] {
            let rva = pe.file_offset_to_rva(probe).unwrap();
            assert_eq!(pe.rva_to_file_offset(rva).unwrap(), probe);
        }
    }
}
