//! Executable format parsing.
//!
//! - [`elf`] - statically linked RISC-V ELF32 executables

pub mod elf;

pub use elf::RiscvElf;
