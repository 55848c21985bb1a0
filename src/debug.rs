//! Interactive single-step debugger.
//!
//! A small REPL over stdin that alternates prompting with single steps of
//! the execution engine. Commands (first token, case-sensitive):
//!
//! - `p` / `print`: dump all 32 registers and the previous/current/next
//!   instruction
//! - `s` / `step` (and any unrecognized input): execute one instruction
//! - `c` / `continue`: run until the next breakpoint or termination
//! - `e` / `exit`: leave the debugger
//!
//! Faults do not end the session; the REPL keeps prompting so the machine
//! state can be inspected after the failure.

use std::io::{self, BufRead, Write};

use crate::emu::{Cpu, Instruction, StepStatus};
use crate::emu::cpu::abi_name;

/// Interactive debugger around a loaded CPU.
pub struct Debugger {
    cpu: Cpu,
}

impl Debugger {
    /// Create a debugger for a CPU that already has a program loaded.
    pub fn new(cpu: Cpu) -> Self {
        Self { cpu }
    }

    /// Run the REPL until the guest terminates or the user exits.
    pub fn run(&mut self) -> anyhow::Result<()> {
        let stdin = io::stdin();
        let mut line = String::new();
        let mut stepping = true;

        loop {
            if stepping {
                print!("(rv32-emu) ");
                io::stdout().flush()?;

                line.clear();
                if stdin.lock().read_line(&mut line)? == 0 {
                    // EOF on stdin ends the session.
                    return Ok(());
                }
                match line.split_whitespace().next().unwrap_or("") {
                    "p" | "print" => {
                        self.print_state();
                        continue;
                    }
                    "e" | "exit" => return Ok(()),
                    "c" | "continue" => stepping = false,
                    // `s`, `step`, and anything else single-steps.
                    _ => {}
                }
            }

            match self.cpu.step() {
                StepStatus::Continue => {}
                StepStatus::Breakpoint => {
                    println!("Breakpoint hit at 0x{:08X}", self.cpu.pc);
                    stepping = true;
                }
                StepStatus::ExitOk => {
                    println!("Program exited normally");
                    return Ok(());
                }
                StepStatus::ExitFail => {
                    println!("Program exited with failure");
                    return Ok(());
                }
                StepStatus::Fault(kind) => {
                    println!("Fault: {} at 0x{:08X}", kind, self.cpu.fault_pc(kind));
                    stepping = true;
                }
            }
        }
    }

    /// Dump the register file and the instructions around the PC.
    fn print_state(&self) {
        println!("Registers:");
        for (i, value) in self.cpu.regs.as_slice().iter().enumerate() {
            print!("x{:<2} {:>4}: 0x{:08X}  ", i, abi_name(i as u8), value);
            if (i + 1) % 4 == 0 {
                println!();
            }
        }

        println!();
        println!("Current Instruction and Context:");
        if self.cpu.pc >= 4 {
            print!("Previous: ");
            self.print_instruction(self.cpu.pc - 4);
        }
        print!("Current:  ");
        self.print_instruction(self.cpu.pc);
        print!("Next:     ");
        self.print_instruction(self.cpu.pc.wrapping_add(4));
    }

    /// Print one instruction as address, raw word, and disassembly.
    fn print_instruction(&self, addr: u32) {
        let word = match self.cpu.memory.read_word(addr) {
            Ok(word) => word,
            Err(_) => {
                println!("0x{:08X}: <out of range>", addr);
                return;
            }
        };
        match Instruction::decode(word) {
            Ok(inst) => println!("0x{:08X}: 0x{:08X}    {}", addr, word, inst),
            Err(_) => println!("0x{:08X}: 0x{:08X}    <undecodable>", addr, word),
        }
    }
}
