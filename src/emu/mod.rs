//! Core emulation logic for user-mode RV32I programs.
//!
//! This module provides the engine that executes RISC-V guest code:
//! - Flat, bounds-checked guest memory
//! - Instruction fetch, decode, and execute for the RV32I base set
//! - The syscall layer behind ECALL (file descriptors, cwd, host I/O)
//!
//! # Example
//!
//! ```no_run
//! use rv32_emu::emu::{Cpu, StepStatus};
//!
//! let mut cpu = Cpu::new();
//! cpu.load_elf(std::path::Path::new("guest.elf"))?;
//! match cpu.run() {
//!     StepStatus::ExitOk => println!("guest exited normally"),
//!     status => println!("guest stopped: {:?}", status),
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod memory;
pub mod instruction;
pub mod cpu;
pub mod kernel;

pub use memory::{Memory, MemoryError};
pub use instruction::{DecodeError, Instruction, InstructionKind};
pub use cpu::{Cpu, CpuState, FaultKind, RegisterFile, StepStatus};
pub use kernel::Kernel;
