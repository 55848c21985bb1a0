//! Syscall layer ("microkernel").
//!
//! Invoked by the execution engine on ECALL. The guest follows a small
//! Linux-style RISC-V ABI: `a7` selects the syscall, `a0`-`a6` carry the
//! arguments, and the result goes back into `a0`.
//!
//! The kernel state is just a current working directory and a table of
//! file descriptors. Slots 0-2 are the host's stdio streams; higher
//! slots hold host filesystem paths opened by the guest (an empty slot
//! is closed). Paths are kept as raw byte sequences end to end — the
//! guest's bytes are never reinterpreted through a character encoding,
//! so GETCWD hands back exactly what CHDIR stored. Host files are opened
//! per call and closed when the handle drops, so no host resource
//! outlives a single syscall.
//!
//! Host I/O failures never stop the engine: the syscall stores the
//! negative [`IO_ERROR`] sentinel in `a0` and execution continues. Only
//! guest memory violations escalate into an engine fault.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use super::cpu::{RegisterFile, StepStatus, A0, A1, A2, A3, A7};
use super::memory::{Memory, MemoryError};

// Linux syscall numbers for the RISC-V ABI.
const SYS_GETCWD: u32 = 17;
const SYS_MKDIRAT: u32 = 34;
const SYS_UNLINKAT: u32 = 35;
const SYS_CHDIR: u32 = 49;
const SYS_FCHDIR: u32 = 50;
const SYS_OPENAT: u32 = 56;
const SYS_CLOSE: u32 = 57;
const SYS_READ: u32 = 63;
const SYS_WRITE: u32 = 64;
const SYS_EXIT: u32 = 93;

/// Directory descriptor sentinel: resolve relative to the cwd.
pub const AT_FDCWD: i32 = -100;

/// Value returned to the guest in `a0` when host I/O fails.
pub const IO_ERROR: u32 = -3i32 as u32;

/// O_CREAT bit of the OPENAT flags argument.
const O_CREAT: u32 = 0x100;

/// Syscall state: working directory and file descriptor table.
#[derive(Debug, Clone)]
pub struct Kernel {
    /// Guest-visible current working directory, as raw path bytes.
    pub cwd: Vec<u8>,
    /// File descriptor table. Slots 0-2 are stdio; an empty slot is
    /// closed.
    pub fds: Vec<Vec<u8>>,
}

impl Kernel {
    /// Create the initial kernel state with the three stdio descriptors.
    pub fn new() -> Self {
        Self {
            cwd: b"/".to_vec(),
            fds: vec![b"stdin".to_vec(), b"stdout".to_vec(), b"stderr".to_vec()],
        }
    }

    /// Whether `fd` names an open, non-stdio host path.
    fn is_valid_fd(&self, fd: i32) -> bool {
        fd >= 3 && (fd as usize) < self.fds.len() && !self.fds[fd as usize].is_empty()
    }

    /// Resolve a guest path against a directory descriptor.
    ///
    /// Paths not starting with `.` are used verbatim. A leading `.` is
    /// replaced by the cwd (for [`AT_FDCWD`]) or by the path behind a
    /// valid directory descriptor. Empty paths resolve to nothing.
    fn resolve_path(&self, path: &[u8], dirfd: i32) -> Option<Vec<u8>> {
        if path.is_empty() {
            return None;
        }
        if path[0] != b'.' {
            return Some(path.to_vec());
        }
        let rest = &path[1..];
        if dirfd == AT_FDCWD {
            let mut resolved = b"./".to_vec();
            resolved.extend_from_slice(&self.cwd);
            resolved.extend_from_slice(rest);
            return Some(resolved);
        }
        if !self.is_valid_fd(dirfd) {
            return None;
        }
        let mut resolved = self.fds[dirfd as usize].clone();
        resolved.extend_from_slice(rest);
        Some(resolved)
    }

    /// Append a path to the descriptor table and return its index.
    fn push_fd(&mut self, path: Vec<u8>) -> u32 {
        self.fds.push(path);
        (self.fds.len() - 1) as u32
    }

    /// Service an ECALL.
    ///
    /// Returns the step status to propagate. `Err` is reserved for guest
    /// memory violations while reading or writing syscall buffers; the
    /// engine turns it into a memory fault.
    pub fn handle_ecall(
        &mut self,
        regs: &mut RegisterFile,
        memory: &mut Memory,
    ) -> Result<StepStatus, MemoryError> {
        let number = regs.read(A7);
        match number {
            SYS_GETCWD => {
                let buf = regs.read(A0);
                memory.write_bytes(buf, &self.cwd)?;
                // No NUL is appended; the guest terminates the buffer.
            }

            SYS_MKDIRAT => {
                let dirfd = regs.read(A0) as i32;
                let path_ptr = regs.read(A1);
                let mode = regs.read(A2);
                let guest_path = memory.read_string(path_ptr)?;
                match self.resolve_path(&guest_path, dirfd) {
                    Some(path) => match make_dir(&host_path(&path), mode) {
                        Ok(()) => {
                            let fd = self.push_fd(path);
                            regs.write(A0, fd);
                        }
                        Err(err) => {
                            log::warn!(
                                "mkdirat {:?} failed: {}",
                                String::from_utf8_lossy(&guest_path),
                                err
                            );
                            regs.write(A0, IO_ERROR);
                        }
                    },
                    None => regs.write(A0, IO_ERROR),
                }
            }

            SYS_UNLINKAT => {
                let dirfd = regs.read(A0) as i32;
                let path_ptr = regs.read(A1);
                let guest_path = memory.read_string(path_ptr)?;
                match self
                    .resolve_path(&guest_path, dirfd)
                    .ok_or(io::Error::from(io::ErrorKind::NotFound))
                    .and_then(|path| std::fs::remove_file(host_path(&path)))
                {
                    Ok(()) => regs.write(A0, 0),
                    Err(err) => {
                        log::warn!(
                            "unlinkat {:?} failed: {}",
                            String::from_utf8_lossy(&guest_path),
                            err
                        );
                        regs.write(A0, IO_ERROR);
                    }
                }
            }

            SYS_CHDIR => {
                let path_ptr = regs.read(A0);
                self.cwd = memory.read_string(path_ptr)?;
                regs.write(A0, 0);
            }

            SYS_FCHDIR => {
                let fd = regs.read(A0) as i32;
                if self.is_valid_fd(fd) {
                    self.cwd = self.fds[fd as usize].clone();
                    regs.write(A0, 0);
                } else {
                    regs.write(A0, IO_ERROR);
                }
            }

            SYS_OPENAT => {
                let dirfd = regs.read(A0) as i32;
                let path_ptr = regs.read(A1);
                let flags = regs.read(A2);
                let mode = regs.read(A3);
                let guest_path = memory.read_string(path_ptr)?;
                match self.resolve_path(&guest_path, dirfd) {
                    Some(path) => {
                        if flags & O_CREAT != 0 {
                            if let Err(err) = create_file(&host_path(&path), mode) {
                                log::warn!(
                                    "openat create {:?} failed: {}",
                                    String::from_utf8_lossy(&path),
                                    err
                                );
                                regs.write(A0, IO_ERROR);
                                return Ok(StepStatus::Continue);
                            }
                        }
                        let fd = self.push_fd(path);
                        regs.write(A0, fd);
                    }
                    None => regs.write(A0, IO_ERROR),
                }
            }

            SYS_CLOSE => {
                let fd = regs.read(A0) as i32;
                if self.is_valid_fd(fd) {
                    self.fds[fd as usize].clear();
                    regs.write(A0, 0);
                } else {
                    regs.write(A0, IO_ERROR);
                }
            }

            SYS_READ => {
                let fd = regs.read(A0) as i32;
                let dest = regs.read(A1);
                let size = regs.read(A2);
                let mut buf = vec![0u8; size as usize];
                let read = if fd == 0 {
                    io::stdin().read(&mut buf)
                } else if self.is_valid_fd(fd) {
                    File::open(host_path(&self.fds[fd as usize]))
                        .and_then(|mut f| f.read(&mut buf))
                } else {
                    Err(io::ErrorKind::InvalidInput.into())
                };
                match read {
                    Ok(n) => {
                        memory.write_bytes(dest, &buf[..n])?;
                        regs.write(A0, n as u32);
                    }
                    Err(err) => {
                        log::warn!("read from fd {} failed: {}", fd, err);
                        regs.write(A0, IO_ERROR);
                    }
                }
            }

            SYS_WRITE => {
                let fd = regs.read(A0) as i32;
                let src = regs.read(A1);
                let size = regs.read(A2);
                let buf = memory.read_bytes(src, size as usize)?;
                let written = match fd {
                    1 => io::stdout().write_all(&buf).and_then(|_| io::stdout().flush()),
                    2 => io::stderr().write_all(&buf),
                    _ if self.is_valid_fd(fd) => OpenOptions::new()
                        .write(true)
                        .open(host_path(&self.fds[fd as usize]))
                        .and_then(|mut f| f.write_all(&buf)),
                    _ => Err(io::ErrorKind::InvalidInput.into()),
                };
                match written {
                    Ok(()) => regs.write(A0, size),
                    Err(err) => {
                        log::warn!("write to fd {} failed: {}", fd, err);
                        regs.write(A0, IO_ERROR);
                    }
                }
            }

            SYS_EXIT => {
                let code = regs.read(A0);
                log::info!("guest exit with code {}", code);
                return Ok(if code == 0 {
                    StepStatus::ExitOk
                } else {
                    StepStatus::ExitFail
                });
            }

            _ => {
                // Unrecognized syscalls succeed silently.
                log::debug!("ignoring unknown syscall {}", number);
                regs.write(A0, 0);
            }
        }
        Ok(StepStatus::Continue)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpret kernel path bytes as a host path.
///
/// On Unix, OS paths are byte sequences, so guest bytes map over
/// directly. Elsewhere the bytes must pass through the platform string
/// type and unrepresentable sequences degrade lossily.
fn host_path(bytes: &[u8]) -> PathBuf {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Create a directory with the guest-supplied mode bits.
fn make_dir(path: &std::path::Path, mode: u32) -> io::Result<()> {
    let mut builder = DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path)
}

/// Create (or open) a file with the guest-supplied mode bits.
///
/// The handle is dropped immediately; the descriptor table only records
/// the path.
fn create_file(path: &std::path::Path, mode: u32) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options.open(path).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::cpu::{Cpu, CpuState};
    use std::path::PathBuf;

    const ECALL: u32 = 0x0000_0073;

    /// A CPU whose first instruction is ECALL, with the kernel cwd set to
    /// something predictable.
    fn cpu_for_ecall() -> Cpu {
        let mut cpu = Cpu::new();
        cpu.memory.write_word(0, ECALL).unwrap();
        cpu.kernel.cwd = b"guest".to_vec();
        cpu.state = CpuState::Running;
        cpu
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rv32-emu-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_resolve_path_verbatim() {
        let kernel = Kernel::new();
        assert_eq!(
            kernel.resolve_path(b"/etc/hosts", AT_FDCWD).unwrap(),
            b"/etc/hosts"
        );
        assert_eq!(kernel.resolve_path(b"data.txt", 99).unwrap(), b"data.txt");
    }

    #[test]
    fn test_resolve_path_through_cwd() {
        let mut kernel = Kernel::new();
        kernel.cwd = b"work".to_vec();
        assert_eq!(
            kernel.resolve_path(b"./out.txt", AT_FDCWD).unwrap(),
            b"./work/out.txt"
        );
        // A bare "." resolves to the cwd itself.
        assert_eq!(kernel.resolve_path(b".", AT_FDCWD).unwrap(), b"./work");
    }

    #[test]
    fn test_resolve_path_through_dirfd() {
        let mut kernel = Kernel::new();
        kernel.fds.push(b"/srv/files".to_vec());
        assert_eq!(
            kernel.resolve_path(b"./a.txt", 3).unwrap(),
            b"/srv/files/a.txt"
        );
        // Stdio and unknown descriptors are not directories.
        assert!(kernel.resolve_path(b"./a.txt", 1).is_none());
        assert!(kernel.resolve_path(b"./a.txt", 42).is_none());
    }

    #[test]
    fn test_resolve_path_rejects_empty() {
        let kernel = Kernel::new();
        assert!(kernel.resolve_path(b"", AT_FDCWD).is_none());
    }

    #[test]
    fn test_getcwd_copies_into_guest_memory() {
        let mut cpu = cpu_for_ecall();
        cpu.regs.write(A7, 17);
        cpu.regs.write(A0, 0x1000);
        assert_eq!(cpu.step(), StepStatus::Continue);
        assert_eq!(cpu.memory.read_bytes(0x1000, 5).unwrap(), b"guest");
    }

    #[test]
    fn test_chdir_sets_cwd() {
        let mut cpu = cpu_for_ecall();
        cpu.memory.write_bytes(0x1000, b"/somewhere\0").unwrap();
        cpu.regs.write(A7, 49);
        cpu.regs.write(A0, 0x1000);
        assert_eq!(cpu.step(), StepStatus::Continue);
        assert_eq!(cpu.kernel.cwd, b"/somewhere");
        assert_eq!(cpu.regs.read(A0), 0);
    }

    #[test]
    fn test_chdir_getcwd_round_trip_is_byte_exact() {
        // A path that is not valid UTF-8 must survive CHDIR + GETCWD
        // exactly as the guest wrote it.
        let raw = [b'/', 0xFF, 0xFE, b'd', b'i', b'r'];
        let mut cpu = cpu_for_ecall();
        cpu.memory.write_bytes(0x1000, &raw).unwrap();
        cpu.memory.write_byte(0x1006, 0).unwrap();
        cpu.regs.write(A7, 49);
        cpu.regs.write(A0, 0x1000);
        cpu.step();
        assert_eq!(cpu.kernel.cwd, raw);

        cpu.pc = 0;
        cpu.regs.write(A7, 17);
        cpu.regs.write(A0, 0x2000);
        cpu.step();
        assert_eq!(cpu.memory.read_bytes(0x2000, raw.len()).unwrap(), raw);
    }

    #[test]
    fn test_fchdir() {
        let mut cpu = cpu_for_ecall();
        cpu.kernel.fds.push(b"/srv".to_vec());
        cpu.regs.write(A7, 50);
        cpu.regs.write(A0, 3);
        cpu.step();
        assert_eq!(cpu.kernel.cwd, b"/srv");

        // Invalid descriptor reports the sentinel and leaves cwd alone.
        let mut cpu = cpu_for_ecall();
        cpu.regs.write(A7, 50);
        cpu.regs.write(A0, 7);
        cpu.step();
        assert_eq!(cpu.regs.read(A0), IO_ERROR);
        assert_eq!(cpu.kernel.cwd, b"guest");
    }

    #[test]
    fn test_close_marks_slot_empty() {
        let mut cpu = cpu_for_ecall();
        cpu.kernel.fds.push(b"/srv/file".to_vec());
        cpu.regs.write(A7, 57);
        cpu.regs.write(A0, 3);
        cpu.step();
        assert!(cpu.kernel.fds[3].is_empty());
        assert_eq!(cpu.regs.read(A0), 0);
    }

    #[test]
    fn test_close_invalid_fd() {
        let mut cpu = cpu_for_ecall();
        cpu.regs.write(A7, 57);
        cpu.regs.write(A0, 1); // stdio is not closable
        cpu.step();
        assert_eq!(cpu.regs.read(A0), IO_ERROR);
    }

    #[test]
    fn test_write_to_stdout_returns_count() {
        let mut cpu = cpu_for_ecall();
        cpu.memory.write_bytes(0x1000, b"Hi!\n\0").unwrap();
        cpu.regs.write(A7, 64);
        cpu.regs.write(A0, 1);
        cpu.regs.write(A1, 0x1000);
        cpu.regs.write(A2, 5);
        assert_eq!(cpu.step(), StepStatus::Continue);
        assert_eq!(cpu.regs.read(A0), 5);
    }

    #[test]
    fn test_write_to_stdin_fd_is_an_error() {
        let mut cpu = cpu_for_ecall();
        cpu.regs.write(A7, 64);
        cpu.regs.write(A0, 0);
        cpu.regs.write(A2, 1);
        cpu.step();
        assert_eq!(cpu.regs.read(A0), IO_ERROR);
    }

    #[test]
    fn test_openat_write_read_unlink_round_trip() {
        let path = temp_path("roundtrip.txt");
        let path_str = path.to_str().unwrap();

        // OPENAT with O_CREAT creates the file and returns a new fd.
        let mut cpu = cpu_for_ecall();
        cpu.memory
            .write_bytes(0x1000, format!("{}\0", path_str).as_bytes())
            .unwrap();
        cpu.regs.write(A7, 56);
        cpu.regs.write(A0, AT_FDCWD as u32);
        cpu.regs.write(A1, 0x1000);
        cpu.regs.write(A2, O_CREAT);
        cpu.regs.write(A3, 0o644);
        cpu.step();
        let fd = cpu.regs.read(A0);
        assert_eq!(fd, 3);
        assert!(path.exists());

        // WRITE guest bytes through the fd.
        cpu.pc = 0;
        cpu.memory.write_bytes(0x2000, b"payload").unwrap();
        cpu.regs.write(A7, 64);
        cpu.regs.write(A0, fd);
        cpu.regs.write(A1, 0x2000);
        cpu.regs.write(A2, 7);
        cpu.step();
        assert_eq!(cpu.regs.read(A0), 7);
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");

        // READ it back into a different guest buffer.
        cpu.pc = 0;
        cpu.regs.write(A7, 63);
        cpu.regs.write(A0, fd);
        cpu.regs.write(A1, 0x3000);
        cpu.regs.write(A2, 32);
        cpu.step();
        assert_eq!(cpu.regs.read(A0), 7);
        assert_eq!(cpu.memory.read_bytes(0x3000, 7).unwrap(), b"payload");

        // UNLINKAT removes it.
        cpu.pc = 0;
        cpu.regs.write(A7, 35);
        cpu.regs.write(A0, AT_FDCWD as u32);
        cpu.regs.write(A1, 0x1000);
        cpu.step();
        assert_eq!(cpu.regs.read(A0), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_openat_without_creat_only_records_path() {
        let path = temp_path("never-created.txt");
        let mut cpu = cpu_for_ecall();
        cpu.memory
            .write_bytes(0x1000, format!("{}\0", path.to_str().unwrap()).as_bytes())
            .unwrap();
        cpu.regs.write(A7, 56);
        cpu.regs.write(A0, AT_FDCWD as u32);
        cpu.regs.write(A1, 0x1000);
        cpu.step();
        assert_eq!(cpu.regs.read(A0), 3);
        assert!(!path.exists());
    }

    #[test]
    fn test_mkdirat_creates_directory_and_fd() {
        let path = temp_path("made-dir");
        let mut cpu = cpu_for_ecall();
        cpu.memory
            .write_bytes(0x1000, format!("{}\0", path.to_str().unwrap()).as_bytes())
            .unwrap();
        cpu.regs.write(A7, 34);
        cpu.regs.write(A0, AT_FDCWD as u32);
        cpu.regs.write(A1, 0x1000);
        cpu.regs.write(A2, 0o755);
        cpu.step();
        assert_eq!(cpu.regs.read(A0), 3);
        assert!(path.is_dir());
        std::fs::remove_dir(&path).unwrap();

        // An empty guest path resolves to nothing and reports the sentinel.
        let mut cpu = cpu_for_ecall();
        cpu.memory.write_bytes(0x1000, b"\0").unwrap();
        cpu.regs.write(A7, 34);
        cpu.regs.write(A0, AT_FDCWD as u32);
        cpu.regs.write(A1, 0x1000);
        cpu.step();
        assert_eq!(cpu.regs.read(A0), IO_ERROR);
    }

    #[test]
    fn test_unknown_syscall_succeeds_silently() {
        let mut cpu = cpu_for_ecall();
        cpu.regs.write(A7, 4040);
        cpu.regs.write(A0, 0xFFFF_FFFF);
        assert_eq!(cpu.step(), StepStatus::Continue);
        assert_eq!(cpu.regs.read(A0), 0);
    }

    #[test]
    fn test_exit_codes() {
        let mut cpu = cpu_for_ecall();
        cpu.regs.write(A7, 93);
        assert_eq!(cpu.step(), StepStatus::ExitOk);

        let mut cpu = cpu_for_ecall();
        cpu.regs.write(A7, 93);
        cpu.regs.write(A0, 3);
        assert_eq!(cpu.step(), StepStatus::ExitFail);
    }

    #[test]
    fn test_syscall_buffer_fault_escalates() {
        // WRITE with a source range outside guest memory.
        let mut cpu = cpu_for_ecall();
        cpu.regs.write(A7, 64);
        cpu.regs.write(A0, 1);
        cpu.regs.write(A1, 0xFFFF_F000);
        cpu.regs.write(A2, 16);
        assert!(matches!(cpu.step(), StepStatus::Fault(_)));
    }
}
