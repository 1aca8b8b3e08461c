use exe::Arch;

use crate::error::ProtectError;
use crate::fixups::{Fixup, FixupContext, FixupOperation, OffsetRelativeTo};
use crate::pe::{self, PeImage, IMAGE_REL_BASED_ABSOLUTE};

/// Section inside `Interpreter.dll` that holds the interpreter machine
/// code. Its content seeds the VM loader section of the protected PE.
pub const VM_FUNCTIONS_SECTION_NAME: &str = ".vmfun";

pub const VM_INTERPRETER_EXPORT: &str = "VmInterpreter";
pub const TLS_CALLBACK_EXPORT: &str = "TlsCallback";

/// The interpreter sidecar, validated and pre-relocated against the host
/// image base.
pub struct Interpreter {
    pe: PeImage,
    vm_section: exe::ImageSectionHeader,
    /// `VmInterpreter` entry, relative to the start of the VM section.
    pub function_offset: u32,
    /// `TlsCallback` entry, relative to the start of the VM section.
    pub tls_callback_offset: u32,
}

impl Interpreter {
    pub fn load(data: &[u8], host_arch: Arch) -> Result<Self, ProtectError> {
        let pe = PeImage::parse(data)
            .map_err(|e| ProtectError::InvalidInterpreter(format!("{}", e)))?;

        if pe.arch() != host_arch {
            return Err(ProtectError::InvalidInterpreter(
                "interpreter bitness does not match the host executable".into(),
            ));
        }

        let vm_section = pe
            .section_by_name(VM_FUNCTIONS_SECTION_NAME)
            .map_err(|_| ProtectError::MissingSection(VM_FUNCTIONS_SECTION_NAME))?;

        let function_offset =
            exported_offset_relative_to_section(&pe, VM_INTERPRETER_EXPORT)?;
        let tls_callback_offset =
            exported_offset_relative_to_section(&pe, TLS_CALLBACK_EXPORT)?;

        Ok(Self {
            pe,
            vm_section,
            function_offset,
            tls_callback_offset,
        })
    }

    /// Rebases the interpreter onto the host image base while also
    /// subtracting the VM section's own virtual address. The section RVA
    /// inside the new PE is unknown at this point; the final fixup pass
    /// adds it back through `AddVmLoaderVa`.
    pub fn prerelocate(&mut self, host_image_base: u64) -> Result<(), ProtectError> {
        let section_delta = 0i64 - self.vm_section.virtual_address.0 as i64;
        let base_delta = host_image_base as i64 - self.pe.image_base() as i64;

        self.pe.relocate(base_delta + section_delta)
    }

    /// Deep copy of the interpreter code section payload.
    pub fn vm_section_data(&self) -> Result<Vec<u8>, ProtectError> {
        self.pe.copy_section_data(&self.vm_section)
    }

    /// Every interpreter relocation that lands inside the VM section
    /// becomes a relocation entry of the output PE plus a fixup adding
    /// the final VM loader virtual address.
    pub fn seed_relocation_fixups(&self, context: &mut FixupContext) -> Result<(), ProtectError> {
        let mut offsets = Vec::new();

        self.pe.each_relocation(|_, rva, entry| {
            if entry.reloc_type() == IMAGE_REL_BASED_ABSOLUTE {
                return;
            }
            if pe::is_rva_within_section(&self.vm_section, rva as u64) {
                offsets.push(pe::rva_to_section_offset(&self.vm_section, rva));
            }
        })?;

        for offset in offsets {
            context.vm_section_offsets_to_relocate.push(offset);
            context.fixups.push(Fixup {
                offset,
                offset_type: OffsetRelativeTo::VmLoader,
                op: FixupOperation::AddVmLoaderVa,
                size: 4,
            });
        }

        Ok(())
    }
}

fn exported_offset_relative_to_section(
    pe: &PeImage,
    name: &'static str,
) -> Result<u32, ProtectError> {
    let exports = pe
        .exports()
        .map_err(|e| ProtectError::InvalidInterpreter(format!("no export table: {}", e)))?;

    let rva = exports
        .iter()
        .find(|(export_name, _)| export_name.as_str() == name)
        .map(|(_, rva)| *rva)
        .ok_or(ProtectError::MissingExport(name))?;

    let section = pe
        .section_by_rva(rva)
        .ok_or_else(|| ProtectError::InvalidInterpreter(format!("export '{}' is unmapped", name)))?;

    Ok(pe::rva_to_section_offset(&section, rva))
}
