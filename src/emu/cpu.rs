//! RV32I execution engine.
//!
//! The [`Cpu`] owns the architectural state of the guest: program
//! counter, register file, guest memory, and the syscall state. One call
//! to [`Cpu::step`] performs one fetch/decode/execute cycle and reports
//! what happened as a [`StepStatus`]; [`Cpu::run`] drives stepping until
//! the guest exits or faults.
//!
//! # PC convention
//!
//! The PC is incremented by 4 right after decode. Branches and jumps
//! therefore compute their targets from the pre-increment PC, and the
//! return address written by JAL/JALR is `pre_increment_pc + 4`.

use std::fmt;
use std::path::Path;

use anyhow::Context;

use super::instruction::{
    AluOp, BranchCond, Instruction, InstructionKind, LoadWidth, StoreWidth,
};
use super::kernel::Kernel;
use super::memory::Memory;
use crate::parser::RiscvElf;

/// Number of general purpose registers.
pub const NUM_REGISTERS: usize = 32;

/// Argument registers of the syscall convention (a0-a3) and the syscall
/// number register (a7).
pub const A0: u8 = 10;
pub const A1: u8 = 11;
pub const A2: u8 = 12;
pub const A3: u8 = 13;
pub const A7: u8 = 17;

/// ABI names of the 32 integer registers, indexed by register number.
const ABI_NAMES: [&str; NUM_REGISTERS] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

/// ABI name of a register (e.g. 10 -> "a0").
pub fn abi_name(reg: u8) -> &'static str {
    ABI_NAMES[(reg & 0x1F) as usize]
}

/// Integer register file.
///
/// 32 × 32-bit registers. Register 0 is hardwired to zero: reads always
/// yield 0 and writes are ignored.
#[derive(Clone)]
pub struct RegisterFile {
    regs: [u32; NUM_REGISTERS],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    /// Create a new zeroed register file.
    pub const fn new() -> Self {
        Self {
            regs: [0; NUM_REGISTERS],
        }
    }

    /// Read a register (0-31).
    #[inline]
    pub fn read(&self, reg: u8) -> u32 {
        let idx = (reg & 0x1F) as usize;
        if idx == 0 {
            0
        } else {
            self.regs[idx]
        }
    }

    /// Write a register (0-31). Writes to register 0 are dropped.
    #[inline]
    pub fn write(&mut self, reg: u8, value: u32) {
        let idx = (reg & 0x1F) as usize;
        if idx != 0 {
            self.regs[idx] = value;
        }
    }

    /// All register values (for display).
    pub fn as_slice(&self) -> &[u32; NUM_REGISTERS] {
        &self.regs
    }
}

impl fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only show non-zero registers; a freshly reset file prints compactly.
        let non_zero: Vec<_> = self
            .regs
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0)
            .collect();

        if non_zero.is_empty() {
            return write!(f, "RegisterFile {{ all zero }}");
        }
        write!(f, "RegisterFile {{ ")?;
        for (i, (reg, val)) in non_zero.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: 0x{:08X}", abi_name(*reg as u8), val)?;
        }
        write!(f, " }}")
    }
}

/// Reason a step faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Instruction fetch out of range.
    Fetch,
    /// Undecodable instruction word.
    Decode,
    /// Data load/store (or syscall buffer access) out of range.
    MemAccess,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::Fetch => "instruction fetch out of range",
            FaultKind::Decode => "illegal instruction",
            FaultKind::MemAccess => "memory access out of range",
        };
        write!(f, "{}", s)
    }
}

/// Result of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Execution can continue with the next instruction.
    Continue,
    /// The guest executed EBREAK.
    Breakpoint,
    /// The guest exited with code 0.
    ExitOk,
    /// The guest exited with a non-zero code.
    ExitFail,
    /// The step aborted; architectural state is at the faulting
    /// instruction.
    Fault(FaultKind),
}

impl StepStatus {
    /// Whether no further stepping is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::ExitOk | StepStatus::ExitFail | StepStatus::Fault(_)
        )
    }
}

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    /// Constructed, nothing loaded.
    Ready,
    /// A program is loaded and steppable. Breakpoints do not leave this
    /// state; the front end decides whether to pause.
    Running,
    /// The guest exited.
    Halted,
    /// A fault or undecodable instruction stopped execution.
    Faulted,
}

/// The RV32I execution engine.
pub struct Cpu {
    /// Guest memory.
    pub memory: Memory,
    /// Integer register file.
    pub regs: RegisterFile,
    /// Address of the next instruction to fetch.
    pub pc: u32,
    /// Syscall layer state (cwd + file descriptor table).
    pub kernel: Kernel,
    /// Lifecycle state.
    pub state: CpuState,
    /// Instructions retired.
    pub instructions: u64,
}

impl Cpu {
    /// Create a CPU with a default-capacity memory.
    pub fn new() -> Self {
        Self::with_memory(Memory::new())
    }

    /// Create a CPU with a memory of the given capacity in bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_memory(Memory::with_capacity(capacity))
    }

    /// Create a CPU around an existing memory.
    pub fn with_memory(memory: Memory) -> Self {
        Self {
            memory,
            regs: RegisterFile::new(),
            pc: 0,
            kernel: Kernel::new(),
            state: CpuState::Ready,
            instructions: 0,
        }
    }

    /// Copy a parsed executable's loadable segments into guest memory
    /// and point the PC at its entry.
    pub fn load_image(&mut self, elf: &RiscvElf) -> anyhow::Result<()> {
        for (i, seg) in elf.load_segments().enumerate() {
            self.memory
                .write_bytes(seg.vaddr, seg.data)
                .with_context(|| {
                    format!(
                        "segment {} ({} bytes at 0x{:08X}) does not fit in guest memory",
                        i,
                        seg.data.len(),
                        seg.vaddr
                    )
                })?;
            log::debug!(
                "loaded segment {}: {} bytes at 0x{:08X}",
                i,
                seg.data.len(),
                seg.vaddr
            );
        }
        self.pc = elf.entry_point();
        self.state = CpuState::Running;
        log::info!("entry point 0x{:08X}", self.pc);
        Ok(())
    }

    /// Load an ELF executable from disk.
    pub fn load_elf(&mut self, path: &Path) -> anyhow::Result<()> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let elf = RiscvElf::parse(&data)?;
        self.load_image(&elf)
    }

    /// Execute one instruction.
    pub fn step(&mut self) -> StepStatus {
        let pc = self.pc;

        let word = match self.memory.read_word(pc) {
            Ok(word) => word,
            Err(_) => return self.fault(FaultKind::Fetch, pc),
        };
        let inst = match Instruction::decode(word) {
            Ok(inst) => inst,
            Err(err) => {
                log::debug!("decode failed at 0x{:08X}: {}", pc, err);
                return self.fault(FaultKind::Decode, pc);
            }
        };

        self.pc = pc.wrapping_add(4);
        self.instructions += 1;

        let status = self.execute(pc, &inst);
        match status {
            StepStatus::ExitOk | StepStatus::ExitFail => self.state = CpuState::Halted,
            StepStatus::Fault(kind) => return self.fault(kind, pc),
            _ => {}
        }
        status
    }

    /// Run until the guest exits or faults.
    ///
    /// Breakpoints are stepped over: EBREAK only pauses execution under
    /// the interactive debugger, which drives [`Cpu::step`] itself.
    pub fn run(&mut self) -> StepStatus {
        loop {
            let status = self.step();
            if status.is_terminal() {
                return status;
            }
            if status == StepStatus::Breakpoint {
                log::debug!(
                    "breakpoint at 0x{:08X} ignored in batch mode",
                    self.pc.wrapping_sub(4)
                );
            }
        }
    }

    /// The instruction address to report for a fault of the given kind.
    ///
    /// Fetch/decode faults happen before the PC increment; data faults
    /// after, so the offending instruction is one word back.
    pub fn fault_pc(&self, kind: FaultKind) -> u32 {
        match kind {
            FaultKind::Fetch | FaultKind::Decode => self.pc,
            FaultKind::MemAccess => self.pc.wrapping_sub(4),
        }
    }

    fn fault(&mut self, kind: FaultKind, pc: u32) -> StepStatus {
        log::warn!("fault at 0x{:08X}: {}", pc, kind);
        self.state = CpuState::Faulted;
        StepStatus::Fault(kind)
    }

    /// Apply one decoded instruction. `pc` is the address of the
    /// instruction itself (the PC has already been incremented).
    fn execute(&mut self, pc: u32, inst: &Instruction) -> StepStatus {
        use InstructionKind::*;

        match inst.kind {
            Nop => StepStatus::Continue,

            Lui { rd, imm } => {
                self.regs.write(rd, imm);
                StepStatus::Continue
            }

            Auipc { rd, imm } => {
                self.regs.write(rd, pc.wrapping_add(imm));
                StepStatus::Continue
            }

            Jal { rd, offset } => {
                self.regs.write(rd, pc.wrapping_add(4));
                self.pc = pc.wrapping_add(offset as u32);
                StepStatus::Continue
            }

            Jalr { rd, rs1, offset } => {
                // Read the base first: rd and rs1 may be the same register.
                let target = self.regs.read(rs1).wrapping_add(offset as u32) & !1;
                self.regs.write(rd, pc.wrapping_add(4));
                self.pc = target;
                StepStatus::Continue
            }

            Branch { cond, rs1, rs2, offset } => {
                let a = self.regs.read(rs1);
                let b = self.regs.read(rs2);
                let taken = match cond {
                    BranchCond::Eq => a == b,
                    BranchCond::Ne => a != b,
                    BranchCond::Lt => (a as i32) < (b as i32),
                    BranchCond::Ge => (a as i32) >= (b as i32),
                    BranchCond::LtU => a < b,
                    BranchCond::GeU => a >= b,
                };
                if taken {
                    self.pc = pc.wrapping_add(offset as u32);
                }
                StepStatus::Continue
            }

            Load { width, rd, rs1, offset } => {
                let addr = self.regs.read(rs1).wrapping_add(offset as u32);
                let value = match self.load(width, addr) {
                    Ok(value) => value,
                    Err(_) => return StepStatus::Fault(FaultKind::MemAccess),
                };
                self.regs.write(rd, value);
                StepStatus::Continue
            }

            Store { width, rs1, rs2, offset } => {
                let addr = self.regs.read(rs1).wrapping_add(offset as u32);
                let value = self.regs.read(rs2);
                let result = match width {
                    StoreWidth::Byte => self.memory.write_byte(addr, value as u8),
                    StoreWidth::Half => self.memory.write_half(addr, value as u16),
                    StoreWidth::Word => self.memory.write_word(addr, value),
                };
                match result {
                    Ok(()) => StepStatus::Continue,
                    Err(_) => StepStatus::Fault(FaultKind::MemAccess),
                }
            }

            OpImm { op, rd, rs1, imm } => {
                let result = alu(op, self.regs.read(rs1), imm as u32);
                self.regs.write(rd, result);
                StepStatus::Continue
            }

            Op { op, rd, rs1, rs2 } => {
                let result = alu(op, self.regs.read(rs1), self.regs.read(rs2));
                self.regs.write(rd, result);
                StepStatus::Continue
            }

            Ecall => match self.kernel.handle_ecall(&mut self.regs, &mut self.memory) {
                Ok(status) => status,
                Err(_) => StepStatus::Fault(FaultKind::MemAccess),
            },

            Ebreak => StepStatus::Breakpoint,
        }
    }

    fn load(&self, width: LoadWidth, addr: u32) -> Result<u32, super::memory::MemoryError> {
        Ok(match width {
            LoadWidth::Byte => self.memory.read_byte(addr)? as i8 as i32 as u32,
            LoadWidth::Half => self.memory.read_half(addr)? as i16 as i32 as u32,
            LoadWidth::Word => self.memory.read_word(addr)?,
            LoadWidth::ByteU => self.memory.read_byte(addr)? as u32,
            LoadWidth::HalfU => self.memory.read_half(addr)? as u32,
        })
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

/// 32-bit ALU with wrap-around arithmetic and mod-32 shift amounts.
fn alu(op: AluOp, a: u32, b: u32) -> u32 {
    match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::Sll => a << (b & 0x1F),
        AluOp::Slt => ((a as i32) < (b as i32)) as u32,
        AluOp::SltU => (a < b) as u32,
        AluOp::Xor => a ^ b,
        AluOp::Srl => a >> (b & 0x1F),
        AluOp::Sra => ((a as i32) >> (b & 0x1F)) as u32,
        AluOp::Or => a | b,
        AluOp::And => a & b,
    }
}
