//! End-to-end scenarios. These need an environment the sandbox contract
//! assumes: unprivileged user namespaces, a writable /tmp and a delegated
//! cgroup v2 subtree with +cpu +memory +pids, named by SANDCAT_TEST_CGROUP.
//! SANDCAT_TEST_ROOTFS may point to a prepared rootfs; it defaults to /.

use std::env;
use std::path::Path;
use std::process;
use std::thread;

use log::info;

use sandcat::{run, JudgeRequest, JudgeResult, Verdict};

mod common;

fn judge_request(tag: &str, cmdline: Vec<&str>) -> JudgeRequest {
  let rootfs = env::var("SANDCAT_TEST_ROOTFS").unwrap_or("/".to_string());
  let cgroup_root = env::var("SANDCAT_TEST_CGROUP")
    .expect("SANDCAT_TEST_CGROUP must name a delegated cgroup v2 subtree");

  let mut request = JudgeRequest::new(cmdline);
  request
    .rootfs(rootfs)
    .cgroup_root(cgroup_root)
    .sandbox_id(format!("test-{}-{}", process::id(), tag));
  request
}

fn judge(mut request: JudgeRequest) -> JudgeResult {
  request.validate().unwrap();
  let result = run(&request).unwrap();
  info!(
    "{} -> {:?} ({} ms, {} MB)",
    request.sandbox_id, result.verdict, result.time_ms, result.memory_mb
  );
  result
}

#[test]
#[ignore = "needs a delegated cgroup v2 subtree in SANDCAT_TEST_CGROUP"]
fn it_should_run_cat_ok() {
  common::setup();
  let mut request = judge_request("cat", vec!["/bin/sh", "-c", "cat"]);
  request.time_limit(1000).memory_limit(64).stdin(&b"hello\n"[..]);

  let result = judge(request);
  assert_eq!(result.verdict, Verdict::Ok);
  assert_eq!(result.stdout_bytes, b"hello\n");
  assert_eq!(result.stderr_bytes, b"");
  assert!(result.time_ms <= 2000);
}

#[test]
#[ignore = "needs a delegated cgroup v2 subtree in SANDCAT_TEST_CGROUP"]
fn it_should_not_run_while1() {
  common::setup();
  let mut request = judge_request("while1", vec!["/bin/sh", "-c", "while :; do :; done"]);
  request.time_limit(200).memory_limit(64);

  let result = judge(request);
  assert_eq!(result.verdict, Verdict::Tle);
  assert!(result.time_ms >= 200 && result.time_ms <= 1300);
}

#[test]
#[ignore = "needs a delegated cgroup v2 subtree in SANDCAT_TEST_CGROUP"]
fn it_should_not_run_oom() {
  common::setup();
  let mut request = judge_request(
    "oom",
    vec![
      "/bin/sh",
      "-c",
      "a=; while :; do a=$a$a$a$a$a$a$a$a$a$aX; done",
    ],
  );
  request.time_limit(5000).memory_limit(16);

  let result = judge(request);
  assert_eq!(result.verdict, Verdict::Mle);
}

#[test]
#[ignore = "needs a delegated cgroup v2 subtree in SANDCAT_TEST_CGROUP"]
fn it_should_not_run_exit7() {
  common::setup();
  let mut request = judge_request("exit7", vec!["/bin/sh", "-c", "exit 7"]);
  request.time_limit(1000).memory_limit(64);

  let result = judge(request);
  assert_eq!(result.verdict, Verdict::Re);
}

#[test]
#[ignore = "needs a delegated cgroup v2 subtree in SANDCAT_TEST_CGROUP"]
fn it_should_materialize_input_files() {
  common::setup();
  let mut request = judge_request("input", vec!["/bin/cat", "/tmp/in.txt"]);
  request
    .time_limit(1000)
    .memory_limit(64)
    .input_file("in.txt", &b"42"[..], 0o644);

  let result = judge(request);
  assert_eq!(result.verdict, Verdict::Ok);
  assert_eq!(result.stdout_bytes, b"42");
}

#[test]
#[ignore = "needs a delegated cgroup v2 subtree in SANDCAT_TEST_CGROUP"]
fn it_should_collect_output_files() {
  common::setup();
  let mut request = judge_request("output", vec!["/bin/sh", "-c", "echo ok > /tmp/out.bin"]);
  request
    .time_limit(1000)
    .memory_limit(64)
    .output_file("out.bin")
    .output_file("never-written");

  let result = judge(request);
  assert_eq!(result.verdict, Verdict::Ok);
  assert_eq!(result.output_files.len(), 2);
  assert_eq!(result.output_files[0].filename, "out.bin");
  assert_eq!(result.output_files[0].content, b"ok\n");
  assert_eq!(result.output_files[1].filename, "never-written");
  assert_eq!(result.output_files[1].content, b"");
}

#[test]
#[ignore = "needs a delegated cgroup v2 subtree in SANDCAT_TEST_CGROUP"]
fn it_should_clean_up_ephemeral_names() {
  common::setup();
  let mut request = judge_request("cleanup", vec!["/bin/sh", "-c", "exit 0"]);
  request.time_limit(1000).memory_limit(64);
  request.validate().unwrap();

  let mountpoint = format!("/tmp/judger_sandbox_{}", request.sandbox_id);
  let cgroup_leaf = request.cgroup_root.join(format!("judge.{}", request.sandbox_id));

  let result = run(&request).unwrap();
  assert_eq!(result.verdict, Verdict::Ok);
  assert!(!Path::new(&mountpoint).exists());
  assert!(!cgroup_leaf.exists());
}

#[test]
#[ignore = "needs a delegated cgroup v2 subtree in SANDCAT_TEST_CGROUP"]
fn it_should_isolate_concurrent_sandboxes() {
  common::setup();

  let spinner = thread::spawn(|| {
    let mut request = judge_request("par-spin", vec!["/bin/sh", "-c", "while :; do :; done"]);
    request.time_limit(200).memory_limit(64);
    judge(request)
  });
  let worker = thread::spawn(|| {
    let mut request = judge_request("par-cat", vec!["/bin/sh", "-c", "cat"]);
    request.time_limit(1000).memory_limit(64).stdin(&b"hello\n"[..]);
    judge(request)
  });

  let spin_result = spinner.join().unwrap();
  let cat_result = worker.join().unwrap();
  assert_eq!(spin_result.verdict, Verdict::Tle);
  assert_eq!(cat_result.verdict, Verdict::Ok);
  assert_eq!(cat_result.stdout_bytes, b"hello\n");
}
