use std::os::unix::prelude::RawFd;

use nix::unistd::{close, pipe, read};

use sandcat::proto;
use sandcat::{JudgeRequest, JudgeResult, OutputFile, Verdict};

mod common;

fn drain(fd: RawFd) -> Vec<u8> {
  let mut bytes = vec![];
  let mut buf = [0u8; 4096];
  loop {
    match read(fd, &mut buf) {
      Ok(0) | Err(_) => break,
      Ok(size) => bytes.extend_from_slice(&buf[..size]),
    }
  }
  bytes
}

#[test]
fn it_should_write_little_endian_primitives() {
  common::setup();
  let (read_fd, write_fd) = pipe().unwrap();

  proto::write_i32(write_fd, 0x01020304).unwrap();
  proto::write_i64(write_fd, 0x0102030405060708).unwrap();
  proto::write_str(write_fd, "hi").unwrap();
  proto::write_str(write_fd, "").unwrap();
  close(write_fd).unwrap();

  let bytes = drain(read_fd);
  close(read_fd).unwrap();

  let mut expected = vec![0x04, 0x03, 0x02, 0x01];
  expected.extend_from_slice(&[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
  expected.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, b'h', b'i']);
  expected.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
  assert_eq!(bytes, expected);
}

#[test]
fn it_should_round_trip_primitives() {
  common::setup();
  let (read_fd, write_fd) = pipe().unwrap();

  proto::write_i32(write_fd, -1).unwrap();
  proto::write_i64(write_fd, i64::MAX).unwrap();
  proto::write_bytes(write_fd, b"\x00\xff\x80").unwrap();
  proto::write_str(write_fd, "sandbox").unwrap();
  close(write_fd).unwrap();

  assert_eq!(proto::read_i32(read_fd).unwrap(), -1);
  assert_eq!(proto::read_i64(read_fd).unwrap(), i64::MAX);
  assert_eq!(proto::read_bytes(read_fd).unwrap(), b"\x00\xff\x80");
  assert_eq!(proto::read_str(read_fd).unwrap(), "sandbox");
  close(read_fd).unwrap();
}

#[test]
fn it_should_fail_on_eof_inside_a_frame() {
  common::setup();
  let (read_fd, write_fd) = pipe().unwrap();

  // A length announcing more bytes than will ever arrive.
  proto::write_i32(write_fd, 100).unwrap();
  proto::write_full(write_fd, b"short").unwrap();
  close(write_fd).unwrap();

  assert!(proto::read_bytes(read_fd).is_err());
  close(read_fd).unwrap();
}

#[test]
fn it_should_reject_negative_lengths() {
  common::setup();
  let (read_fd, write_fd) = pipe().unwrap();

  proto::write_i32(write_fd, -5).unwrap();
  close(write_fd).unwrap();

  assert!(proto::read_bytes(read_fd).is_err());
  close(read_fd).unwrap();
}

#[test]
fn it_should_round_trip_a_request_frame() {
  common::setup();
  let (read_fd, write_fd) = pipe().unwrap();

  let mut request = JudgeRequest::new(vec!["/bin/sh", "-c", "cat"]);
  request
    .time_limit(200)
    .memory_limit(64)
    .pids_limit(4)
    .rootfs("/srv/rootfs")
    .tmpfs_size("16M")
    .cgroup_root("/sys/fs/cgroup/judge")
    .sandbox_id("round-trip")
    .stdin(&b"hello\n"[..])
    .input_file("in.txt", &b"42"[..], 0o644)
    .output_file("out.bin");

  request.write_to(write_fd).unwrap();
  close(write_fd).unwrap();

  let decoded = JudgeRequest::read_from(read_fd).unwrap();
  close(read_fd).unwrap();

  assert_eq!(decoded.time_limit_ms, 200);
  assert_eq!(decoded.memory_limit_mb, 64);
  assert_eq!(decoded.pids_limit, 4);
  assert_eq!(decoded.rootfs_path.to_str(), Some("/srv/rootfs"));
  assert_eq!(decoded.tmpfs_size, "16M");
  assert_eq!(decoded.cgroup_root.to_str(), Some("/sys/fs/cgroup/judge"));
  assert_eq!(decoded.sandbox_id, "round-trip");
  assert_eq!(decoded.stdin_bytes, b"hello\n");
  assert_eq!(decoded.cmdline, vec!["/bin/sh", "-c", "cat"]);
  assert_eq!(decoded.input_files.len(), 1);
  assert_eq!(decoded.input_files[0].filename, "in.txt");
  assert_eq!(decoded.input_files[0].content, b"42");
  assert_eq!(decoded.input_files[0].mode, 0o644);
  assert_eq!(decoded.output_filenames, vec!["out.bin"]);
}

#[test]
fn it_should_round_trip_a_result_frame() {
  common::setup();
  let (read_fd, write_fd) = pipe().unwrap();

  let result = JudgeResult {
    verdict: Verdict::Tle,
    time_ms: 1234,
    memory_mb: 57,
    stdout_bytes: b"partial".to_vec(),
    stderr_bytes: vec![],
    output_files: vec![
      OutputFile {
        filename: "out.bin".to_string(),
        content: b"ok\n".to_vec(),
      },
      OutputFile {
        filename: "missing".to_string(),
        content: vec![],
      },
    ],
  };

  result.write_to(write_fd).unwrap();
  close(write_fd).unwrap();

  let decoded = JudgeResult::read_from(read_fd).unwrap();
  close(read_fd).unwrap();

  assert_eq!(decoded.verdict, Verdict::Tle);
  assert_eq!(decoded.time_ms, 1234);
  assert_eq!(decoded.memory_mb, 57);
  assert_eq!(decoded.stdout_bytes, b"partial");
  assert_eq!(decoded.stderr_bytes, b"");
  assert_eq!(decoded.output_files.len(), 2);
  assert_eq!(decoded.output_files[0].filename, "out.bin");
  assert_eq!(decoded.output_files[0].content, b"ok\n");
  assert_eq!(decoded.output_files[1].content, b"");
}

#[test]
fn it_should_reject_unknown_verdicts() {
  common::setup();
  assert!(Verdict::from_code(5).is_err());
  assert!(Verdict::from_code(-1).is_err());
  for code in 0..5 {
    assert_eq!(Verdict::from_code(code).unwrap().code(), code);
  }
}
