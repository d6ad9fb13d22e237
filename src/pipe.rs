use std::cell::Cell;
use std::os::unix::prelude::RawFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::{self, close, pipe2};

use crate::error::SandCatError;

const CLOSED: RawFd = -1;

/// Anonymous close-on-exec pipe shared across a `clone`.
///
/// Each side keeps its own copy of the descriptor table, so the parent and
/// the child pick their role independently: a barrier caller uses
/// `release` / `wait`, the result channel uses `into_writer` / `into_reader`.
/// Every role method closes the counterpart end first, and whatever is
/// still open when the pipe goes out of scope is closed on drop, so an
/// early error return cannot leak descriptors.
pub struct SandCatPipe {
  read_fd: Cell<RawFd>,
  write_fd: Cell<RawFd>,
}

impl SandCatPipe {
  pub fn new() -> Result<Self, SandCatError> {
    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC)?;
    Ok(SandCatPipe {
      read_fd: Cell::new(read_fd),
      write_fd: Cell::new(write_fd),
    })
  }

  /// Barrier, releasing side: signal one byte and close.
  pub fn release(&self) -> Result<(), SandCatError> {
    self.close_read();
    unistd::write(self.write_fd.get(), b"1")?;
    self.close_write();
    Ok(())
  }

  /// Barrier, waiting side: close the write end, block for the byte.
  pub fn wait(&self) -> Result<(), SandCatError> {
    self.close_write();
    let mut buf = [0u8; 1];
    loop {
      match unistd::read(self.read_fd.get(), &mut buf) {
        Ok(0) => return Err(SandCatError::fork("Barrier closed before release")),
        Ok(_) => break,
        Err(Errno::EINTR) => continue,
        Err(errno) => return Err(SandCatError::Nix(errno)),
      }
    }
    self.close_read();
    Ok(())
  }

  /// Keep the read end for framed reads, close the write end. The read
  /// end stays owned here and is closed on drop.
  pub fn into_reader(&self) -> RawFd {
    self.close_write();
    self.read_fd.get()
  }

  /// Keep the write end for framed writes, close the read end. The write
  /// end stays owned here and is closed on drop.
  pub fn into_writer(&self) -> RawFd {
    self.close_read();
    self.write_fd.get()
  }

  fn close_read(&self) {
    let fd = self.read_fd.replace(CLOSED);
    if fd != CLOSED {
      let _ = close(fd);
    }
  }

  fn close_write(&self) {
    let fd = self.write_fd.replace(CLOSED);
    if fd != CLOSED {
      let _ = close(fd);
    }
  }
}

impl Drop for SandCatPipe {
  fn drop(&mut self) {
    self.close_read();
    self.close_write();
  }
}
