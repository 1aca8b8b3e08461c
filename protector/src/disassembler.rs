use std::collections::{HashMap, HashSet};

use exe::{Arch, ImageSectionHeader};
use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register};

use crate::error::ProtectError;
use crate::pe::{self, PeImage};
use crate::virtualizer::is_immediate;

/// Where a pending linear sweep resumes: an RVA plus the matching file
/// offset into the host buffer.
#[derive(Debug, Clone, Copy)]
pub struct DisassemblyPoint {
    pub rva: u64,
    pub offset: usize,
}

/// Bytes inside `.text` that turned out to be data (a jump table) and
/// must not be decoded as instructions.
#[derive(Debug, Clone, Copy)]
pub struct AddressRange {
    pub begin_address: u64,
    pub end_address: u64,
}

enum DisassemblyAction {
    NextInstruction,
    NextDisassemblyPoint,
}

/// Recursive-descent discovery over the host's `.text` section.
///
/// The engine pops pending points off a LIFO, decodes linearly from each
/// one and classifies every instruction to find further entry points:
/// branch targets, jump tables, function pointers stored through `MOV`
/// and `PUSH`, and (optionally) pointer-sized slots in `.rdata`.
pub struct DisassemblyEngine<'a> {
    pe: &'a PeImage,
    arch: Arch,
    bitness: u32,
    image_base: u64,
    text_section: ImageSectionHeader,
    text_end: usize,
    scan_rdata: bool,
    queue: Vec<DisassemblyPoint>,
    visited: HashSet<u64>,
    delivered: HashMap<u64, usize>,
    data_ranges: Vec<AddressRange>,
}

impl<'a> DisassemblyEngine<'a> {
    pub fn new(pe: &'a PeImage, scan_rdata: bool) -> Result<Self, ProtectError> {
        let text_section = pe
            .section_by_name(".text")
            .map_err(|_| ProtectError::MissingSection(".text"))?;

        let text_end = text_section.pointer_to_raw_data.0 as usize
            + text_section.size_of_raw_data as usize;

        let bitness = match pe.arch() {
            Arch::X86 => 32,
            Arch::X64 => 64,
        };

        Ok(Self {
            pe,
            arch: pe.arch(),
            bitness,
            image_base: pe.image_base(),
            text_section,
            text_end: text_end.min(pe.len()),
            scan_rdata,
            queue: Vec::new(),
            visited: HashSet::new(),
            delivered: HashMap::new(),
            data_ranges: Vec::new(),
        })
    }

    pub fn data_ranges(&self) -> &[AddressRange] {
        &self.data_ranges
    }

    /// Runs the discovery to exhaustion. `on_instruction` sees every
    /// decoded instruction exactly once; `on_invalid` fires with
    /// `(address, size)` when a sweep lands inside a known data range.
    pub fn disassemble_from_entrypoint<F, G>(
        &mut self,
        mut on_instruction: F,
        mut on_invalid: G,
    ) -> Result<(), ProtectError>
    where
        F: FnMut(&Instruction) -> Result<(), ProtectError>,
        G: FnMut(u64, usize),
    {
        self.add_disassembly_point(self.pe.entry_point() as u64);

        if self.scan_rdata {
            self.parse_rdata_section()?;
        }

        while let Some(point) = self.queue.pop() {
            self.disassemble_stream(point, &mut on_instruction, &mut on_invalid)?;
        }

        Ok(())
    }

    fn disassemble_stream<F, G>(
        &mut self,
        point: DisassemblyPoint,
        on_instruction: &mut F,
        on_invalid: &mut G,
    ) -> Result<(), ProtectError>
    where
        F: FnMut(&Instruction) -> Result<(), ProtectError>,
        G: FnMut(u64, usize),
    {
        if point.offset >= self.text_end {
            return Ok(());
        }

        let data = self.pe.data();
        let mut decoder = Decoder::with_ip(
            self.bitness,
            &data[point.offset..self.text_end],
            point.rva,
            DecoderOptions::NONE,
        );
        let mut instruction = Instruction::default();

        while decoder.can_decode() {
            let stream_position = decoder.position();
            let address = point.rva + stream_position as u64;
            let position = point.offset + stream_position;
            decoder.decode_out(&mut instruction);

            // Checked ahead of the decode result: bytes inside a jump
            // table may not decode at all.
            if self.is_address_within_data_range(address) {
                let size = self
                    .delivered
                    .get(&address)
                    .copied()
                    .unwrap_or(instruction.len());
                on_invalid(address, size);
                return Ok(());
            }

            if instruction.is_invalid() {
                return Ok(());
            }

            // The sweep merged into code another point already covered.
            if self.delivered.contains_key(&address) {
                return Ok(());
            }
            self.delivered.insert(address, instruction.len());

            on_instruction(&instruction)?;

            match self.parse_instruction(&instruction, position) {
                DisassemblyAction::NextInstruction => {}
                DisassemblyAction::NextDisassemblyPoint => return Ok(()),
            }
        }

        Ok(())
    }

    fn parse_instruction(
        &mut self,
        instruction: &Instruction,
        position: usize,
    ) -> DisassemblyAction {
        let flow = instruction.flow_control();

        if flow == FlowControl::Return {
            return DisassemblyAction::NextDisassemblyPoint;
        }

        let is_call = matches!(flow, FlowControl::Call | FlowControl::IndirectCall);
        let is_jump = matches!(
            flow,
            FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::ConditionalBranch
        );

        if is_call || is_jump {
            if instruction.op_count() != 1 {
                return DisassemblyAction::NextDisassemblyPoint;
            }

            match instruction.op0_kind() {
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                    self.add_disassembly_point(instruction.near_branch_target());
                }
                _ => {
                    if self.is_jump_table(instruction, position) {
                        let table_rva = self.memory_operand_rva(instruction);
                        self.parse_jump_table(table_rva);
                        return DisassemblyAction::NextDisassemblyPoint;
                    }
                }
            }

            return if is_guaranteed_jump(instruction) {
                DisassemblyAction::NextDisassemblyPoint
            } else {
                DisassemblyAction::NextInstruction
            };
        }

        if flow == FlowControl::Interrupt {
            return DisassemblyAction::NextDisassemblyPoint;
        }

        match instruction.mnemonic() {
            Mnemonic::Mov if instruction.op_count() == 2 => {
                if self.is_jump_table(instruction, position) {
                    let table_rva = self.memory_operand_rva(instruction);
                    self.parse_jump_table(table_rva);
                    return DisassemblyAction::NextDisassemblyPoint;
                }

                if self.is_vtable_or_function(instruction) {
                    let target_rva =
                        self.operand_rva_from_immediate(instruction.immediate(1));
                    if pe::is_rva_within_section(&self.text_section, target_rva) {
                        if let Ok(target_offset) = self.pe.rva_to_file_offset(target_rva as u32)
                        {
                            if self.is_function(target_offset, target_rva) {
                                self.add_disassembly_point(target_rva);
                            }
                            // A target that is not a function prologue may
                            // be a vtable; that walk stays disabled.
                        }
                    }
                }

                DisassemblyAction::NextInstruction
            }

            Mnemonic::Push
                if instruction.op_count() == 1 && is_immediate(instruction.op0_kind()) =>
            {
                let target_rva = self.operand_rva_from_immediate(instruction.immediate(0));
                if pe::is_rva_within_section(&self.text_section, target_rva) {
                    if let Ok(target_offset) = self.pe.rva_to_file_offset(target_rva as u32) {
                        if self.is_function(target_offset, target_rva) {
                            self.add_disassembly_point(target_rva);
                        }
                    }
                }

                DisassemblyAction::NextInstruction
            }

            _ => DisassemblyAction::NextInstruction,
        }
    }

    /// Scans `.rdata` for pointer-sized values that look like function
    /// pointers into `.text` and seeds a disassembly point for each.
    fn parse_rdata_section(&mut self) -> Result<(), ProtectError> {
        let rdata = self
            .pe
            .section_by_name(".rdata")
            .map_err(|_| ProtectError::MissingSection(".rdata"))?;

        let stride = match self.arch {
            Arch::X86 => 4usize,
            Arch::X64 => 8usize,
        };

        let data = self.pe.data();
        let base_offset = rdata.pointer_to_raw_data.0 as usize;

        let mut i = 0usize;
        while i + stride <= rdata.size_of_raw_data as usize {
            let slot = base_offset + i;
            i += stride;

            if slot + stride > data.len() {
                break;
            }

            let value = match self.arch {
                Arch::X86 => {
                    u32::from_le_bytes(data[slot..slot + 4].try_into().unwrap()) as u64
                }
                Arch::X64 => u64::from_le_bytes(data[slot..slot + 8].try_into().unwrap()),
            };

            if value == 0 {
                continue;
            }

            let rva = value.wrapping_sub(self.image_base);
            if !pe::is_rva_within_section(&self.text_section, rva) {
                continue;
            }

            if let Ok(offset) = self.pe.rva_to_file_offset(rva as u32) {
                if self.is_function(offset, rva) {
                    self.add_disassembly_point(rva);
                }
            }
        }

        Ok(())
    }

    fn add_disassembly_point(&mut self, rva: u64) {
        if self.visited.contains(&rva) {
            return;
        }
        if !pe::is_rva_within_section(&self.text_section, rva) {
            return;
        }
        let Ok(offset) = self.pe.rva_to_file_offset(rva as u32) else {
            return;
        };
        if offset >= self.text_end {
            return;
        }

        self.visited.insert(rva);
        self.queue.push(DisassemblyPoint { rva, offset });
    }

    fn is_address_within_data_range(&self, address: u64) -> bool {
        self.data_ranges
            .iter()
            .any(|range| address >= range.begin_address && address < range.end_address)
    }

    /// Immediate (or loaded 32-bit table entry) to RVA: on x64 the value
    /// already is one, on x86 the image base has to come off first.
    fn operand_rva_from_immediate(&self, value: u64) -> u64 {
        match self.arch {
            Arch::X86 => value.wrapping_sub(self.image_base),
            Arch::X64 => value,
        }
    }

    fn memory_operand_rva(&self, instruction: &Instruction) -> u64 {
        self.operand_rva_from_immediate(instruction.memory_displacement64())
    }

    fn section_contains(&self, rva: u64) -> bool {
        rva <= u32::MAX as u64 && self.pe.section_by_rva(rva as u32).is_some()
    }

    fn is_vtable_or_function(&self, instruction: &Instruction) -> bool {
        instruction.op0_kind() == OpKind::Memory
            && is_immediate(instruction.op1_kind())
            && self.section_contains(self.operand_rva_from_immediate(instruction.immediate(1)))
    }

    pub fn is_jump_table(&self, instruction: &Instruction, position: usize) -> bool {
        match self.arch {
            Arch::X86 => self.is_jump_table_x86(instruction),
            Arch::X64 => self.is_jump_table_x64(instruction, position),
        }
    }

    fn is_jump_table_x86(&self, instruction: &Instruction) -> bool {
        if instruction.op_count() != 1 {
            return false;
        }
        if !is_guaranteed_jump(instruction) && instruction.mnemonic() != Mnemonic::Mov {
            return false;
        }
        if instruction.op0_kind() != OpKind::Memory || instruction.memory_index_scale() != 4 {
            return false;
        }

        let table_rva = self.memory_operand_rva(instruction);
        pe::is_rva_within_section(&self.text_section, table_rva)
    }

    /// The x64 idiom is three instructions long:
    /// `MOV reg, [base + idx*4 + disp]`, `ADD reg, other`, `JMP reg`.
    /// The two instructions past the current one are lookahead-decoded
    /// to confirm.
    fn is_jump_table_x64(&self, instruction: &Instruction, position: usize) -> bool {
        if instruction.mnemonic() != Mnemonic::Mov || instruction.op_count() != 2 {
            return false;
        }
        if instruction.op0_kind() != OpKind::Register {
            return false;
        }
        if instruction.op1_kind() != OpKind::Memory || instruction.memory_index_scale() != 4 {
            return false;
        }

        let next_offset = position + instruction.len();
        if next_offset >= self.text_end {
            return false;
        }

        let data = self.pe.data();
        let mut decoder = Decoder::with_ip(
            self.bitness,
            &data[next_offset..self.text_end],
            instruction.next_ip(),
            DecoderOptions::NONE,
        );

        let add = decoder.decode();
        if add.is_invalid()
            || add.mnemonic() != Mnemonic::Add
            || add.op_count() != 2
            || add.op0_kind() != OpKind::Register
            || add.op1_kind() != OpKind::Register
        {
            return false;
        }
        let destination = add.op0_register();

        if !decoder.can_decode() {
            return false;
        }
        let jump = decoder.decode();

        is_guaranteed_jump(&jump)
            && jump.op_count() == 1
            && jump.op0_kind() == OpKind::Register
            && jump.op0_register() == destination
    }

    /// Walks 4-byte table entries from `table_rva`, enqueueing each
    /// target until a terminator (`0`, `0xCCCCCCCC`, or a value outside
    /// `.text`), then records the scanned bytes as a data range.
    fn parse_jump_table(&mut self, table_rva: u64) {
        let mut scanned = 0usize;

        if self.section_contains(table_rva) {
            if let Ok(table_offset) = self.pe.rva_to_file_offset(table_rva as u32) {
                let data_len = self.pe.len();
                loop {
                    let entry_offset = table_offset + scanned;
                    if entry_offset + 4 > data_len {
                        break;
                    }

                    let data = self.pe.data();
                    let value = u32::from_le_bytes(
                        data[entry_offset..entry_offset + 4].try_into().unwrap(),
                    );
                    if value == 0 || value == 0xCCCC_CCCC {
                        break;
                    }

                    let target_rva = self.operand_rva_from_immediate(value as u64);
                    if !pe::is_rva_within_section(&self.text_section, target_rva) {
                        break;
                    }

                    self.add_disassembly_point(target_rva);
                    scanned += 4;
                }
            }
        }

        self.data_ranges.push(AddressRange {
            begin_address: table_rva,
            end_address: table_rva + scanned as u64,
        });
    }

    pub fn is_function(&self, offset: usize, rva: u64) -> bool {
        match self.arch {
            Arch::X86 => self.is_function_x86(offset, rva, 0),
            Arch::X64 => self.is_function_x64(offset, rva, 0),
        }
    }

    /// x86 prologue: `PUSH EBP; MOV EBP, ESP`, optionally preceded by
    /// the `MOV EDI, EDI` hot-patch pad, following unconditional jumps
    /// up to ten hops.
    fn is_function_x86(&self, offset: usize, rva: u64, depth: u32) -> bool {
        if depth > 10 || offset >= self.text_end {
            return false;
        }

        let data = self.pe.data();
        let mut decoder = Decoder::with_ip(
            self.bitness,
            &data[offset..self.text_end],
            rva,
            DecoderOptions::NONE,
        );

        let mut window = Vec::with_capacity(3);
        for _ in 0..3 {
            if !decoder.can_decode() {
                return false;
            }
            let decoded = decoder.decode();
            if decoded.is_invalid() {
                return false;
            }
            window.push(decoded);
        }

        if is_guaranteed_jump(&window[0]) {
            return match self.follow_jump(&window[0]) {
                Some((target_offset, target_rva)) => {
                    self.is_function_x86(target_offset, target_rva, depth + 1)
                }
                None => false,
            };
        }

        let hot_patch_pad = window[0].mnemonic() == Mnemonic::Mov
            && window[0].op_count() == 2
            && window[0].op0_kind() == OpKind::Register
            && window[0].op1_kind() == OpKind::Register
            && window[0].op0_register() == Register::EDI
            && window[0].op1_register() == Register::EDI;

        let (first, second) = if hot_patch_pad {
            (&window[1], &window[2])
        } else {
            (&window[0], &window[1])
        };

        if first.op_count() != 1
            || first.mnemonic() != Mnemonic::Push
            || first.op0_kind() != OpKind::Register
            || first.op0_register() != Register::EBP
        {
            return false;
        }

        second.mnemonic() == Mnemonic::Mov
            && second.op_count() == 2
            && second.op0_kind() == OpKind::Register
            && second.op0_register() == Register::EBP
            && second.op1_kind() == OpKind::Register
            && second.op1_register() == Register::ESP
    }

    /// x64 prologue: a run of `MOV [RSP+disp], reg` home-space saves
    /// whose first displacement `k*8` dictates `k-1` further saves,
    /// followed by `SUB RSP, imm` within ten instructions. An initial
    /// unconditional jump is followed like on x86.
    fn is_function_x64(&self, offset: usize, rva: u64, depth: u32) -> bool {
        if depth > 10 || offset >= self.text_end {
            return false;
        }

        let data = self.pe.data();
        let mut decoder = Decoder::with_ip(
            self.bitness,
            &data[offset..self.text_end],
            rva,
            DecoderOptions::NONE,
        );

        if !decoder.can_decode() {
            return false;
        }
        let first = decoder.decode();
        if first.is_invalid() {
            return false;
        }

        if is_guaranteed_jump(&first) {
            return match self.follow_jump(&first) {
                Some((target_offset, target_rva)) => {
                    self.is_function_x64(target_offset, target_rva, depth + 1)
                }
                None => false,
            };
        }

        let Some(displacement) = mov_rsp_disp_reg(&first) else {
            return false;
        };
        if displacement <= 0 || displacement % 8 != 0 {
            return false;
        }

        let additional_saves = (displacement / 8 - 1) as u64;
        for _ in 0..additional_saves {
            if !decoder.can_decode() {
                return false;
            }
            let save = decoder.decode();
            if save.is_invalid() || mov_rsp_disp_reg(&save).is_none() {
                return false;
            }
        }

        for _ in 0..10 {
            if !decoder.can_decode() {
                return false;
            }
            let candidate = decoder.decode();
            if candidate.is_invalid() {
                return false;
            }
            if candidate.mnemonic() == Mnemonic::Sub
                && candidate.op_count() == 2
                && candidate.op0_kind() == OpKind::Register
                && candidate.op0_register() == Register::RSP
                && is_immediate(candidate.op1_kind())
            {
                return true;
            }
        }

        false
    }

    fn follow_jump(&self, jump: &Instruction) -> Option<(usize, u64)> {
        if !matches!(
            jump.op0_kind(),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        ) {
            return None;
        }

        let target = jump.near_branch_target();
        if !pe::is_rva_within_section(&self.text_section, target) {
            return None;
        }

        let offset = self.pe.rva_to_file_offset(target as u32).ok()?;
        Some((offset, target))
    }
}

fn is_guaranteed_jump(instruction: &Instruction) -> bool {
    instruction.mnemonic() == Mnemonic::Jmp
}

fn mov_rsp_disp_reg(instruction: &Instruction) -> Option<i64> {
    if instruction.mnemonic() == Mnemonic::Mov
        && instruction.op_count() == 2
        && instruction.op0_kind() == OpKind::Memory
        && instruction.memory_base() == Register::RSP
        && instruction.op1_kind() == OpKind::Register
    {
        let displacement = instruction.memory_displacement64() as i64;
        if displacement != 0 {
            return Some(displacement);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Code, MemoryOperand};

    #[test]
    fn test_guaranteed_jump() {
        let jmp = Instruction::with_branch(Code::Jmp_rel32_32, 0x1000).unwrap();
        assert!(is_guaranteed_jump(&jmp));

        let jne = Instruction::with_branch(Code::Jne_rel32_32, 0x1000).unwrap();
        assert!(!is_guaranteed_jump(&jne));
    }

    #[test]
    fn test_mov_rsp_disp_reg() {
        let save = Instruction::with2(
            Code::Mov_rm64_r64,
            MemoryOperand::with_base_displ(Register::RSP, 0x18),
            Register::R8,
        )
        .unwrap();
        assert_eq!(mov_rsp_disp_reg(&save), Some(0x18));

        let no_disp = Instruction::with2(
            Code::Mov_rm64_r64,
            MemoryOperand::with_base(Register::RSP),
            Register::RCX,
        )
        .unwrap();
        assert_eq!(mov_rsp_disp_reg(&no_disp), None);

        let other_base = Instruction::with2(
            Code::Mov_rm64_r64,
            MemoryOperand::with_base_displ(Register::RBP, 0x18),
            Register::RCX,
        )
        .unwrap();
        assert_eq!(mov_rsp_disp_reg(&other_base), None);
    }
}
