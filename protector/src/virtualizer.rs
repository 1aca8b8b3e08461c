use exe::Arch;
use iced_x86::{Instruction, Mnemonic, OpKind, Register};

use crate::shellcode::{
    Shellcode, IMAGE_BASE, ORIG_ADDR, VM_CODE_ADDR, VM_CORE_FUNCTION, VM_OPCODE_ENCRYPTION_KEY,
};

/// Operations the interpreter sidecar implements. The numbering is part
/// of the wire contract with `Interpreter.dll`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOpcode {
    MovRegImm = 1,
    PushImm,
    AddRegImm,
    AddRegReg,
    SubRegImm,
    SubRegReg,
    Nop,
}

impl VmOpcode {
    /// Whether the interpreter reproduces this operation's flag results.
    /// Flag-writing instructions without emulation must not be
    /// virtualized.
    pub fn emulates_eflags(self) -> bool {
        matches!(
            self,
            VmOpcode::AddRegImm | VmOpcode::AddRegReg | VmOpcode::SubRegImm | VmOpcode::SubRegReg
        )
    }
}

/// Maps an instruction to the interpreter operation that can stand in
/// for it, or `None` when the instruction stays native.
pub fn vm_opcode(instruction: &Instruction) -> Option<VmOpcode> {
    match instruction.mnemonic() {
        Mnemonic::Mov if instruction.op_count() == 2 => {
            if instruction.op0_kind() != OpKind::Register {
                return None;
            }
            vm_register(instruction.op0_register())?;

            if is_immediate(instruction.op1_kind()) {
                Some(VmOpcode::MovRegImm)
            } else {
                None
            }
        }
        Mnemonic::Push
            if instruction.op_count() == 1 && is_immediate(instruction.op0_kind()) =>
        {
            Some(VmOpcode::PushImm)
        }
        mnemonic @ (Mnemonic::Add | Mnemonic::Sub) if instruction.op_count() == 2 => {
            if instruction.op0_kind() != OpKind::Register {
                return None;
            }
            vm_register(instruction.op0_register())?;

            let is_add = mnemonic == Mnemonic::Add;
            if is_immediate(instruction.op1_kind()) {
                Some(if is_add {
                    VmOpcode::AddRegImm
                } else {
                    VmOpcode::SubRegImm
                })
            } else if instruction.op1_kind() == OpKind::Register {
                vm_register(instruction.op1_register())?;
                Some(if is_add {
                    VmOpcode::AddRegReg
                } else {
                    VmOpcode::SubRegReg
                })
            } else {
                None
            }
        }
        Mnemonic::Nop => Some(VmOpcode::Nop),
        _ => None,
    }
}

/// Emits the bytecode record the interpreter consumes for one
/// instruction.
///
/// Layout (little-endian): encrypted opcode u32, instruction length u8,
/// destination register u8, source register u8, operand width in bits
/// u8, immediate u64, relocation count u8, then one byte per relocated
/// offset relative to the instruction start.
pub fn virtualized_code(
    instruction: &Instruction,
    opcode: VmOpcode,
    encryption_key: u32,
    relocations: &[u64],
) -> Vec<u8> {
    let mut bytecode = Vec::with_capacity(16 + relocations.len());

    bytecode.extend_from_slice(&((opcode as u32) ^ encryption_key).to_le_bytes());
    bytecode.push(instruction.len() as u8);

    let (dst, src) = operand_registers(instruction);
    bytecode.push(dst);
    bytecode.push(src);
    bytecode.push(operand_width_bits(instruction));

    let immediate = operand_immediate(instruction);
    bytecode.extend_from_slice(&immediate.to_le_bytes());

    bytecode.push(relocations.len() as u8);
    for &rva in relocations {
        bytecode.push((rva - instruction.ip()) as u8);
    }

    bytecode
}

/// Builds the native loader stub that hands control to the interpreter.
/// Every named slot sits one byte past its opcode so the PC-relative
/// fixup arithmetic in the pipeline lines up.
pub fn loader_shellcode(arch: Arch, image_base: u64) -> Shellcode {
    let mut shellcode = Shellcode::new();

    match arch {
        Arch::X86 => {
            // pushad / pushfd
            shellcode.push_bytes(&[0x60, 0x9C]);
            // push imm32 (opcode decryption key)
            shellcode.push_bytes(&[0x68]);
            shellcode.push_variable_u32(VM_OPCODE_ENCRYPTION_KEY, 0);
            // push imm32 (virtualized code address)
            shellcode.push_bytes(&[0x68]);
            shellcode.push_variable_u32(VM_CODE_ADDR, 0);
            // push imm32 (image base, patched by the loader via .reloc)
            shellcode.push_bytes(&[0x68]);
            shellcode.push_variable_u32(IMAGE_BASE, image_base as u32);
            // call rel32 into the interpreter entry
            shellcode.push_bytes(&[0xE8]);
            shellcode.push_variable_u32(VM_CORE_FUNCTION, 0);
            // add esp, 0xC / popfd / popad
            shellcode.push_bytes(&[0x83, 0xC4, 0x0C, 0x9D, 0x61]);
            // jmp rel32 back behind the replaced instruction
            shellcode.push_bytes(&[0xE9]);
            shellcode.push_variable_u32(ORIG_ADDR, 0);
        }
        Arch::X64 => {
            // pushfq / push rax / push rcx / push rdx / push r8 / push r9
            shellcode.push_bytes(&[0x9C, 0x50, 0x51, 0x52, 0x41, 0x50, 0x41, 0x51]);
            // mov rcx, imm64 (image base, patched by the loader via .reloc)
            shellcode.push_bytes(&[0x48, 0xB9]);
            shellcode.push_variable_u64(IMAGE_BASE, image_base);
            // mov rdx, imm64 (virtualized code address)
            shellcode.push_bytes(&[0x48, 0xBA]);
            shellcode.push_variable_u64(VM_CODE_ADDR, 0);
            // mov r8d, imm32 (opcode decryption key)
            shellcode.push_bytes(&[0x41, 0xB8]);
            shellcode.push_variable_u32(VM_OPCODE_ENCRYPTION_KEY, 0);
            // sub rsp, 0x20 / call rel32
            shellcode.push_bytes(&[0x48, 0x83, 0xEC, 0x20, 0xE8]);
            shellcode.push_variable_u32(VM_CORE_FUNCTION, 0);
            // add rsp, 0x20 / pop r9 / pop r8 / pop rdx / pop rcx / pop rax / popfq
            shellcode.push_bytes(&[
                0x48, 0x83, 0xC4, 0x20, 0x41, 0x59, 0x41, 0x58, 0x5A, 0x59, 0x58, 0x9D,
            ]);
            // jmp rel32 back behind the replaced instruction
            shellcode.push_bytes(&[0xE9]);
            shellcode.push_variable_u32(ORIG_ADDR, 0);
        }
    }

    shellcode
}

pub fn is_immediate(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}

/// Interpreter register id, 1-based over the 16 general purpose
/// registers. Sub-registers map onto their parent.
fn vm_register(register: Register) -> Option<u8> {
    let id = match register {
        Register::RAX | Register::EAX | Register::AX | Register::AL | Register::AH => 1,
        Register::RCX | Register::ECX | Register::CX | Register::CL | Register::CH => 2,
        Register::RDX | Register::EDX | Register::DX | Register::DL | Register::DH => 3,
        Register::RBX | Register::EBX | Register::BX | Register::BL | Register::BH => 4,
        Register::RSP | Register::ESP | Register::SP | Register::SPL => 5,
        Register::RBP | Register::EBP | Register::BP | Register::BPL => 6,
        Register::RSI | Register::ESI | Register::SI | Register::SIL => 7,
        Register::RDI | Register::EDI | Register::DI | Register::DIL => 8,
        Register::R8 | Register::R8D | Register::R8W | Register::R8L => 9,
        Register::R9 | Register::R9D | Register::R9W | Register::R9L => 10,
        Register::R10 | Register::R10D | Register::R10W | Register::R10L => 11,
        Register::R11 | Register::R11D | Register::R11W | Register::R11L => 12,
        Register::R12 | Register::R12D | Register::R12W | Register::R12L => 13,
        Register::R13 | Register::R13D | Register::R13W | Register::R13L => 14,
        Register::R14 | Register::R14D | Register::R14W | Register::R14L => 15,
        Register::R15 | Register::R15D | Register::R15W | Register::R15L => 16,
        _ => return None,
    };

    Some(id)
}

fn operand_registers(instruction: &Instruction) -> (u8, u8) {
    let mut dst = 0;
    let mut src = 0;

    if instruction.op_count() >= 1 && instruction.op0_kind() == OpKind::Register {
        dst = vm_register(instruction.op0_register()).unwrap_or(0);
    }
    if instruction.op_count() >= 2 && instruction.op1_kind() == OpKind::Register {
        src = vm_register(instruction.op1_register()).unwrap_or(0);
    }

    (dst, src)
}

fn operand_immediate(instruction: &Instruction) -> u64 {
    for i in 0..instruction.op_count() {
        if is_immediate(instruction.op_kind(i)) {
            return instruction.immediate(i);
        }
    }
    0
}

fn operand_width_bits(instruction: &Instruction) -> u8 {
    for i in 0..instruction.op_count() {
        if instruction.op_kind(i) == OpKind::Register {
            return (instruction.op_register(i).size() * 8) as u8;
        }
    }
    if instruction.op_count() == 0 {
        return 0;
    }
    match instruction.op0_kind() {
        OpKind::Immediate8 => 8,
        OpKind::Immediate16 | OpKind::Immediate8to16 => 16,
        OpKind::Immediate32 | OpKind::Immediate8to32 => 32,
        _ => 64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Code, MemoryOperand};

    #[test]
    fn test_opcode_classification() {
        let mov_imm =
            Instruction::with2(Code::Mov_r32_imm32, Register::EAX, 0x1234u32).unwrap();
        assert_eq!(vm_opcode(&mov_imm), Some(VmOpcode::MovRegImm));

        let add_reg =
            Instruction::with2(Code::Add_rm32_r32, Register::EBX, Register::EAX).unwrap();
        assert_eq!(vm_opcode(&add_reg), Some(VmOpcode::AddRegReg));
        assert!(vm_opcode(&add_reg).unwrap().emulates_eflags());

        let push_reg = Instruction::with1(Code::Push_r32, Register::EBP).unwrap();
        assert_eq!(vm_opcode(&push_reg), None);

        let push_imm = Instruction::with1(Code::Pushd_imm32, 0x401000u32).unwrap();
        assert_eq!(vm_opcode(&push_imm), Some(VmOpcode::PushImm));

        let mov_reg = Instruction::with2(Code::Mov_r32_rm32, Register::EBP, Register::ESP).unwrap();
        assert_eq!(vm_opcode(&mov_reg), None);

        let mov_mem = Instruction::with2(
            Code::Mov_r32_rm32,
            Register::EAX,
            MemoryOperand::with_base(Register::ECX),
        )
        .unwrap();
        assert_eq!(vm_opcode(&mov_mem), None);
    }

    #[test]
    fn test_bytecode_layout() {
        let instruction =
            Instruction::with2(Code::Mov_r32_imm32, Register::EAX, 0xDEADu32).unwrap();
        let key = 0x1000;
        let bytecode = virtualized_code(&instruction, VmOpcode::MovRegImm, key, &[1]);

        let opcode = u32::from_le_bytes(bytecode[0..4].try_into().unwrap());
        assert_eq!(opcode ^ key, VmOpcode::MovRegImm as u32);
        assert_eq!(bytecode[5], 1); // dst = rax
        assert_eq!(bytecode[6], 0); // no source register
        assert_eq!(bytecode[7], 32);
        assert_eq!(
            u64::from_le_bytes(bytecode[8..16].try_into().unwrap()),
            0xDEAD
        );
        assert_eq!(bytecode[16], 1);
        assert_eq!(bytecode[17], 1);
    }

    #[test]
    fn test_loader_slots_follow_their_opcodes() {
        for arch in [Arch::X86, Arch::X64] {
            let shellcode = loader_shellcode(arch, 0x400000);
            let buffer = shellcode.buffer();

            let call_slot = shellcode.named_value_offset(VM_CORE_FUNCTION).unwrap() as usize;
            assert_eq!(buffer[call_slot - 1], 0xE8);

            let jmp_slot = shellcode.named_value_offset(ORIG_ADDR).unwrap() as usize;
            assert_eq!(buffer[jmp_slot - 1], 0xE9);
            assert_eq!(jmp_slot + 4, buffer.len());

            shellcode.named_value_offset(IMAGE_BASE).unwrap();
            shellcode.named_value_offset(VM_CODE_ADDR).unwrap();
            shellcode.named_value_offset(VM_OPCODE_ENCRYPTION_KEY).unwrap();
        }
    }
}
