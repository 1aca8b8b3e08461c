use std::collections::HashMap;

use crate::error::ProtectError;

pub const VM_OPCODE_ENCRYPTION_KEY: &str = "VmOpcodeEncryptionKey";
pub const VM_CODE_ADDR: &str = "VmCodeAddr";
pub const VM_CORE_FUNCTION: &str = "VmCoreFunction";
pub const ORIG_ADDR: &str = "OrigAddr";
pub const IMAGE_BASE: &str = "ImageBase";

/// A shellcode template: a byte buffer with named value slots that the
/// pipeline patches before the buffer is appended to a section.
pub struct Shellcode {
    buffer: Vec<u8>,
    variables: HashMap<&'static str, u32>,
}

impl Shellcode {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            variables: HashMap::new(),
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn push_variable_u32(&mut self, name: &'static str, value: u32) {
        self.variables.insert(name, self.buffer.len() as u32);
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_variable_u64(&mut self, name: &'static str, value: u64) {
        self.variables.insert(name, self.buffer.len() as u32);
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Offset of a named slot relative to the start of the buffer.
    pub fn named_value_offset(&self, name: &'static str) -> Result<u32, ProtectError> {
        self.variables
            .get(name)
            .copied()
            .ok_or(ProtectError::UnknownShellcodeVariable(name))
    }

    pub fn modify_u32(&mut self, name: &'static str, value: u32) -> Result<(), ProtectError> {
        let offset = self.named_value_offset(name)? as usize;
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn modify_u64(&mut self, name: &'static str, value: u64) -> Result<(), ProtectError> {
        let offset = self.named_value_offset(name)? as usize;
        self.buffer[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

impl Default for Shellcode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_slots() {
        let mut shellcode = Shellcode::new();
        shellcode.push_bytes(&[0x90, 0x90]);
        shellcode.push_variable_u32("slot", 0xAABBCCDD);
        shellcode.push_bytes(&[0xC3]);

        assert_eq!(shellcode.named_value_offset("slot").unwrap(), 2);
        assert_eq!(shellcode.buffer().len(), 7);
        assert_eq!(&shellcode.buffer()[2..6], &[0xDD, 0xCC, 0xBB, 0xAA]);

        shellcode.modify_u32("slot", 0x11223344).unwrap();
        assert_eq!(&shellcode.buffer()[2..6], &[0x44, 0x33, 0x22, 0x11]);

        assert!(shellcode.named_value_offset("missing").is_err());
    }

    #[test]
    fn test_u64_slot() {
        let mut shellcode = Shellcode::new();
        shellcode.push_bytes(&[0x48, 0xB8]);
        shellcode.push_variable_u64("imm", 0);
        shellcode.modify_u64("imm", u64::MAX).unwrap();

        assert_eq!(shellcode.named_value_offset("imm").unwrap(), 2);
        assert_eq!(&shellcode.buffer()[2..10], &[0xFF; 8]);
    }
}
