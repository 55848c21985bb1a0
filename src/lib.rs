//! rv32-emu library
//!
//! Core emulation logic for user-mode RV32I programs.
//!
//! # Module Organization
//!
//! - [`parser`]: ELF32 executable loader (RISC-V specifics validated on top of goblin)
//! - [`emu`]: guest memory, instruction decoder, CPU, and the syscall layer
//! - [`config`]: layered configuration (config files + environment)
//! - [`debug`]: interactive single-step debugger REPL

pub mod parser;
pub mod emu;
pub mod config;
pub mod debug;
