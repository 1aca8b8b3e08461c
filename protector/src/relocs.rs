use crate::error::ProtectError;
use crate::pe::PeImage;

/// Sorted view of the host's relocation RVAs, used to answer "which
/// relocations land inside this instruction" during virtualization.
pub struct RelocationIndex {
    rvas: Vec<u64>,
}

impl RelocationIndex {
    pub fn from_pe(pe: &PeImage) -> Result<Self, ProtectError> {
        let mut rvas = pe.relocation_rvas()?;
        rvas.sort_unstable();
        Ok(Self { rvas })
    }

    #[cfg(test)]
    fn from_rvas(mut rvas: Vec<u64>) -> Self {
        rvas.sort_unstable();
        Self { rvas }
    }

    /// Relocation RVAs within `[address, address + size)`, ascending.
    pub fn within_instruction(&self, address: u64, size: usize) -> Vec<u64> {
        let end = address + size as u64;
        let start = self.rvas.partition_point(|&rva| rva < address);

        self.rvas[start..]
            .iter()
            .take_while(|&&rva| rva < end)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_instruction() {
        let index = RelocationIndex::from_rvas(vec![0x1010, 0x1001, 0x1003, 0x2000]);

        assert_eq!(index.within_instruction(0x1000, 5), vec![0x1001, 0x1003]);
        assert_eq!(index.within_instruction(0x1001, 1), vec![0x1001]);
        assert_eq!(index.within_instruction(0x1004, 4), Vec::<u64>::new());
        assert_eq!(index.within_instruction(0x200F, 2), Vec::<u64>::new());
        assert_eq!(index.within_instruction(0x1FFF, 2), vec![0x2000]);
    }

    #[test]
    fn test_results_are_ascending() {
        let index = RelocationIndex::from_rvas(vec![0x1004, 0x1000, 0x1002]);
        assert_eq!(
            index.within_instruction(0x1000, 6),
            vec![0x1000, 0x1002, 0x1004]
        );
    }
}
