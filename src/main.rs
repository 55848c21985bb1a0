//! rv32-emu: User-mode emulator for 32-bit RISC-V (RV32I) executables

use std::env;
use std::path::Path;

use rv32_emu::config::Config;
use rv32_emu::debug::Debugger;
use rv32_emu::emu::{Cpu, StepStatus};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    // Parse options: flags start with '-', the first other argument is
    // the executable path.
    let mut debug_mode = false;
    let mut path = None;

    for arg in &args[1..] {
        if arg == "-debug" || arg == "--debug" {
            debug_mode = true;
        } else if !arg.starts_with('-') {
            path = Some(arg.as_str());
        }
    }

    let path = match path {
        Some(p) => p,
        None => {
            eprintln!("Usage: rv32-emu <elf-path> [-debug]");
            std::process::exit(2);
        }
    };

    let config = Config::get();
    let mut cpu = Cpu::with_capacity(config.memory_size());
    cpu.load_elf(Path::new(path))?;
    cpu.kernel.cwd = initial_cwd(config, Path::new(path));
    log::debug!(
        "initial guest cwd: {}",
        String::from_utf8_lossy(&cpu.kernel.cwd)
    );

    if debug_mode {
        Debugger::new(cpu).run()
    } else {
        run_batch(cpu)
    }
}

/// Determine the guest's initial working directory: the configured
/// override, else the directory of the executable, else the host cwd.
/// The kernel keeps the cwd as raw path bytes.
fn initial_cwd(config: &Config, elf_path: &Path) -> Vec<u8> {
    if let Some(cwd) = &config.initial_cwd {
        return cwd.clone().into_bytes();
    }
    elf_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.as_os_str().as_encoded_bytes().to_vec())
        .unwrap_or_else(|| {
            env::current_dir()
                .map(|dir| dir.as_os_str().as_encoded_bytes().to_vec())
                .unwrap_or_else(|_| b".".to_vec())
        })
}

/// Run the guest to termination and mirror its outcome in the host exit
/// code.
fn run_batch(mut cpu: Cpu) -> anyhow::Result<()> {
    match cpu.run() {
        StepStatus::ExitOk => {
            log::info!("guest exited normally after {} instructions", cpu.instructions);
            Ok(())
        }
        StepStatus::ExitFail => {
            eprintln!("Program exited with failure");
            std::process::exit(1);
        }
        StepStatus::Fault(kind) => {
            eprintln!("Fault: {} at 0x{:08X}", kind, cpu.fault_pc(kind));
            std::process::exit(1);
        }
        status => Err(anyhow::anyhow!("unexpected step status {:?}", status)),
    }
}
