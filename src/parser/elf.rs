//! RISC-V ELF32 executable parser.
//!
//! Parses statically linked 32-bit little-endian RISC-V executables. The
//! emulator consumes only the entry point and the `PT_LOAD` program
//! headers; sections, symbols, and relocation data are irrelevant for
//! execution and ignored.
//!
//! # Example
//!
//! ```no_run
//! use rv32_emu::parser::RiscvElf;
//!
//! let data = std::fs::read("guest.elf")?;
//! let elf = RiscvElf::parse(&data)?;
//!
//! println!("Entry point: 0x{:08X}", elf.entry_point());
//! for seg in elf.load_segments() {
//!     println!("segment: {} bytes at 0x{:08X}", seg.data.len(), seg.vaddr);
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, bail, Result};
use goblin::elf::{header::ET_EXEC, program_header::PT_LOAD, Elf};

/// RISC-V machine type in the ELF header (e_machine field).
pub const EM_RISCV: u16 = 0xF3;

/// Index of the OS/ABI byte in e_ident.
const EI_OSABI: usize = 7;

/// A loadable segment from the ELF.
#[derive(Debug, Clone)]
pub struct LoadSegment<'a> {
    /// Virtual address where the segment loads.
    pub vaddr: u32,
    /// Memory size (larger than the file data for BSS).
    pub memsz: u32,
    /// Raw segment bytes from the file.
    pub data: &'a [u8],
    /// Segment is executable.
    pub executable: bool,
    /// Segment is writable.
    pub writable: bool,
}

/// Parsed RISC-V ELF executable.
pub struct RiscvElf<'a> {
    /// Raw ELF file bytes.
    data: &'a [u8],
    /// Parsed ELF structure.
    elf: Elf<'a>,
}

impl<'a> std::fmt::Debug for RiscvElf<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiscvElf")
            .field("entry_point", &format_args!("0x{:08X}", self.entry_point()))
            .field("load_segments", &self.load_segments().count())
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl<'a> RiscvElf<'a> {
    /// Parse a RISC-V ELF32 executable from raw bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let elf = Elf::parse(data).map_err(|e| anyhow!("Failed to parse ELF: {}", e))?;

        if elf.is_64 {
            bail!("Not a 32-bit ELF");
        }
        if !elf.little_endian {
            bail!("Not a little-endian ELF");
        }
        if elf.header.e_version != 1 {
            bail!("Unsupported ELF version: {}", elf.header.e_version);
        }
        if elf.header.e_ident[EI_OSABI] != 0 {
            bail!(
                "Unsupported OS/ABI: {} (expected 0, System V)",
                elf.header.e_ident[EI_OSABI]
            );
        }
        if elf.header.e_type != ET_EXEC {
            bail!(
                "Not a statically linked executable: e_type {} (expected {})",
                elf.header.e_type,
                ET_EXEC
            );
        }
        if elf.header.e_machine != EM_RISCV {
            bail!(
                "Not a RISC-V ELF: machine type 0x{:X}, expected 0x{:X} (EM_RISCV)",
                elf.header.e_machine,
                EM_RISCV
            );
        }

        // Validate PT_LOAD file ranges up front so segment iteration
        // cannot index past the file.
        for (i, ph) in elf.program_headers.iter().enumerate() {
            if ph.p_type != PT_LOAD {
                continue;
            }
            let end = ph.p_offset.checked_add(ph.p_filesz);
            if end.map_or(true, |end| end > data.len() as u64) {
                bail!(
                    "Segment {} file range 0x{:X}+0x{:X} exceeds file size {}",
                    i,
                    ph.p_offset,
                    ph.p_filesz,
                    data.len()
                );
            }
        }

        Ok(Self { data, elf })
    }

    /// Get the entry point address.
    pub fn entry_point(&self) -> u32 {
        self.elf.header.e_entry as u32
    }

    /// Iterate over loadable segments with file content.
    pub fn load_segments(&self) -> impl Iterator<Item = LoadSegment<'a>> + '_ {
        self.elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD && ph.p_filesz > 0)
            .map(|ph| {
                let offset = ph.p_offset as usize;
                let filesz = ph.p_filesz as usize;

                LoadSegment {
                    vaddr: ph.p_vaddr as u32,
                    memsz: ph.p_memsz as u32,
                    data: &self.data[offset..offset + filesz],
                    executable: ph.p_flags & 0x1 != 0, // PF_X
                    writable: ph.p_flags & 0x2 != 0,   // PF_W
                }
            })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::{Cpu, StepStatus};

    /// Build a minimal valid RISC-V ELF32 around the given code words.
    ///
    /// Layout: 52-byte ELF header, one program header at offset 52, code
    /// at offset 128 loaded at virtual address 0.
    fn make_minimal_riscv_elf(code: &[u32]) -> Vec<u8> {
        let filesz = (code.len() * 4) as u32;
        let mut elf = vec![0u8; 128 + code.len() * 4];

        // ELF magic
        elf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);

        // ELF32, little-endian, version 1, System V ABI
        elf[4] = 1; // ELFCLASS32
        elf[5] = 1; // ELFDATA2LSB
        elf[6] = 1; // EV_CURRENT

        // e_type = ET_EXEC (2)
        elf[16..18].copy_from_slice(&2u16.to_le_bytes());

        // e_machine = EM_RISCV (0xF3)
        elf[18..20].copy_from_slice(&0xF3u16.to_le_bytes());

        // e_version = 1
        elf[20..24].copy_from_slice(&1u32.to_le_bytes());

        // e_entry = 0
        elf[24..28].copy_from_slice(&0u32.to_le_bytes());

        // e_phoff = 52 (right after header)
        elf[28..32].copy_from_slice(&52u32.to_le_bytes());

        // e_ehsize = 52
        elf[40..42].copy_from_slice(&52u16.to_le_bytes());

        // e_phentsize = 32, e_phnum = 1
        elf[42..44].copy_from_slice(&32u16.to_le_bytes());
        elf[44..46].copy_from_slice(&1u16.to_le_bytes());

        // e_shentsize = 40, e_shnum = 0
        elf[46..48].copy_from_slice(&40u16.to_le_bytes());

        // Program header at offset 52:
        // p_type = PT_LOAD (1)
        elf[52..56].copy_from_slice(&1u32.to_le_bytes());
        // p_offset = 128
        elf[56..60].copy_from_slice(&128u32.to_le_bytes());
        // p_vaddr = 0, p_paddr = 0 (already zeroed)
        // p_filesz = p_memsz = code bytes
        elf[68..72].copy_from_slice(&filesz.to_le_bytes());
        elf[72..76].copy_from_slice(&filesz.to_le_bytes());
        // p_flags = PF_R | PF_X (5)
        elf[76..80].copy_from_slice(&5u32.to_le_bytes());
        // p_align = 4
        elf[80..84].copy_from_slice(&4u32.to_le_bytes());

        // Code at offset 128
        for (i, word) in code.iter().enumerate() {
            elf[128 + i * 4..132 + i * 4].copy_from_slice(&word.to_le_bytes());
        }

        elf
    }

    #[test]
    fn test_em_riscv_constant() {
        assert_eq!(EM_RISCV, 0xF3);
        assert_eq!(EM_RISCV, 243);
    }

    #[test]
    fn test_parse_minimal_elf() {
        let data = make_minimal_riscv_elf(&[0x0000_0013]);
        let elf = RiscvElf::parse(&data).unwrap();

        assert_eq!(elf.entry_point(), 0);
        let segments: Vec<_> = elf.load_segments().collect();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].vaddr, 0);
        assert_eq!(segments[0].memsz, 4);
        assert_eq!(segments[0].data, 0x0000_0013u32.to_le_bytes());
        assert!(segments[0].executable);
        assert!(!segments[0].writable);
    }

    #[test]
    fn test_reject_non_riscv_machine() {
        let mut data = make_minimal_riscv_elf(&[0]);
        // Change machine type to x86-64 (0x3E)
        data[18..20].copy_from_slice(&0x3Eu16.to_le_bytes());

        let result = RiscvElf::parse(&data);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Not a RISC-V ELF"));
    }

    #[test]
    fn test_reject_non_executable() {
        let mut data = make_minimal_riscv_elf(&[0]);
        // e_type = ET_DYN (3)
        data[16..18].copy_from_slice(&3u16.to_le_bytes());
        assert!(RiscvElf::parse(&data).is_err());
    }

    #[test]
    fn test_reject_wrong_osabi() {
        let mut data = make_minimal_riscv_elf(&[0]);
        data[7] = 3; // GNU/Linux OSABI
        assert!(RiscvElf::parse(&data).is_err());
    }

    #[test]
    fn test_reject_truncated_segment() {
        let mut data = make_minimal_riscv_elf(&[0]);
        // Claim more file bytes than exist.
        data[68..72].copy_from_slice(&0x10000u32.to_le_bytes());
        let result = RiscvElf::parse(&data);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds file size"));
    }

    #[test]
    fn test_load_and_run_end_to_end() {
        // addi x1, x0, 5
        // addi x2, x1, 7
        // add  x3, x1, x2
        // addi x17, x0, 93
        // ecall (exit 0)
        let data = make_minimal_riscv_elf(&[
            0x0050_0093,
            0x0070_8113,
            0x0020_81B3,
            0x05D0_0893,
            0x0000_0073,
        ]);
        let elf = RiscvElf::parse(&data).unwrap();

        let mut cpu = Cpu::new();
        cpu.load_image(&elf).unwrap();
        assert_eq!(cpu.pc, 0);
        assert_eq!(cpu.run(), StepStatus::ExitOk);
        assert_eq!(cpu.regs.read(1), 5);
        assert_eq!(cpu.regs.read(2), 12);
        assert_eq!(cpu.regs.read(3), 17);
    }

    #[test]
    fn test_segment_too_large_for_guest_memory() {
        let data = make_minimal_riscv_elf(&[0x0000_0013]);
        let elf = RiscvElf::parse(&data).unwrap();

        let mut cpu = Cpu::with_capacity(2); // smaller than the segment
        assert!(cpu.load_image(&elf).is_err());
    }
}
