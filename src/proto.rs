//! Length-prefixed framing over raw file descriptors.
//!
//! Integers are fixed-width little-endian. A byte string is an `i32` length
//! (which may be zero) followed by the raw bytes. Sequences are an `i32`
//! count followed by that many elements. The same frame layout is used on
//! the caller facing stdio and on the internal result pipe.

use std::os::unix::prelude::RawFd;

use nix::errno::Errno;
use nix::unistd;

use crate::error::SandCatError;

/// Read exactly `buf.len()` bytes, retrying on `EINTR`.
/// EOF in the middle of a frame is an error.
pub fn read_full(fd: RawFd, buf: &mut [u8]) -> Result<(), SandCatError> {
  let mut total = 0;
  while total < buf.len() {
    match unistd::read(fd, &mut buf[total..]) {
      Ok(0) => return Err(SandCatError::proto("Unexpected EOF while reading frame")),
      Ok(size) => total += size,
      Err(Errno::EINTR) => continue,
      Err(errno) => return Err(SandCatError::Nix(errno)),
    }
  }
  Ok(())
}

/// Write all of `buf`, retrying on `EINTR` and short writes.
pub fn write_full(fd: RawFd, buf: &[u8]) -> Result<(), SandCatError> {
  let mut total = 0;
  while total < buf.len() {
    match unistd::write(fd, &buf[total..]) {
      Ok(size) => total += size,
      Err(Errno::EINTR) => continue,
      Err(errno) => return Err(SandCatError::Nix(errno)),
    }
  }
  Ok(())
}

pub fn read_i32(fd: RawFd) -> Result<i32, SandCatError> {
  let mut buf = [0u8; 4];
  read_full(fd, &mut buf)?;
  Ok(i32::from_le_bytes(buf))
}

pub fn write_i32(fd: RawFd, value: i32) -> Result<(), SandCatError> {
  write_full(fd, &value.to_le_bytes())
}

pub fn read_i64(fd: RawFd) -> Result<i64, SandCatError> {
  let mut buf = [0u8; 8];
  read_full(fd, &mut buf)?;
  Ok(i64::from_le_bytes(buf))
}

pub fn write_i64(fd: RawFd, value: i64) -> Result<(), SandCatError> {
  write_full(fd, &value.to_le_bytes())
}

pub fn read_bytes(fd: RawFd) -> Result<Vec<u8>, SandCatError> {
  let len = read_i32(fd)?;
  if len < 0 {
    return Err(SandCatError::proto(format!("Negative length {}", len)));
  }
  let mut buf = vec![0u8; len as usize];
  read_full(fd, &mut buf)?;
  Ok(buf)
}

pub fn write_bytes(fd: RawFd, bytes: &[u8]) -> Result<(), SandCatError> {
  if bytes.len() > i32::MAX as usize {
    return Err(SandCatError::proto("Byte string too long for frame"));
  }
  write_i32(fd, bytes.len() as i32)?;
  write_full(fd, bytes)
}

pub fn read_str(fd: RawFd) -> Result<String, SandCatError> {
  let bytes = read_bytes(fd)?;
  String::from_utf8(bytes).map_err(|_| SandCatError::proto("String is not valid UTF-8"))
}

pub fn write_str(fd: RawFd, text: &str) -> Result<(), SandCatError> {
  write_bytes(fd, text.as_bytes())
}

/// Read a sequence count and refuse the obviously malformed ones.
pub fn read_count(fd: RawFd) -> Result<usize, SandCatError> {
  let count = read_i32(fd)?;
  if count < 0 {
    return Err(SandCatError::proto(format!("Negative count {}", count)));
  }
  Ok(count as usize)
}
