use std::fs;

use log::{error, info};

use nix::libc;
use nix::mount::{mount, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{sethostname, Pid};

use crate::cgroup::SandCatCgroup;
use crate::context::{JudgeRequest, JudgeResult, OutputFile, Verdict};
use crate::error::SandCatError;
use crate::executor;
use crate::mount::SandboxFs;
use crate::pipe::SandCatPipe;

pub const STACK_SIZE: usize = 1024 * 1024;

/// Entry of the middle process. It is apparent root inside the user
/// namespace the driver created, and it always answers with exactly one
/// result frame on the result pipe: a setup failure becomes a UKE response
/// after the mounts and the cgroup leaf have been torn down.
pub fn sandbox_init(
  request: &JudgeRequest,
  barrier: &SandCatPipe,
  result_pipe: &SandCatPipe,
) -> isize {
  let result_fd = result_pipe.into_writer();

  let result = match run_sandbox(request, barrier) {
    Ok(result) => result,
    Err(err) => {
      error!("Sandbox setup fails: {}", err);
      JudgeResult::internal_error(&err)
    }
  };

  match result.write_to(result_fd) {
    Ok(_) => 0,
    Err(err) => {
      error!("Write result fails: {}", err);
      1
    }
  }
}

fn run_sandbox(
  request: &JudgeRequest,
  barrier: &SandCatPipe,
) -> Result<JudgeResult, SandCatError> {
  // The driver releases the barrier once our uid/gid map is installed;
  // before that this process has no identity and may not mount anything.
  barrier.wait()?;

  sethostname("sandbox")?;

  // Keep every mount below private to this namespace.
  mount::<str, str, str, str>(
    None,
    "/",
    None,
    MsFlags::MS_REC | MsFlags::MS_PRIVATE,
    None,
  )
  .map_err(|err| SandCatError::mount(format!("Remount / private fails: {}", err)))?;

  let sandbox_fs = SandboxFs::setup(&request.sandbox_id, &request.rootfs_path, &request.tmpfs_size)?;
  sandbox_fs.materialize(&request.input_files)?;

  let cgroup = SandCatCgroup::create(&request.cgroup_root, &request.sandbox_id)?;
  cgroup.apply_limits(request)?;

  let inner_barrier = SandCatPipe::new()?;
  let root = sandbox_fs.root().to_path_buf();
  let mut stack = vec![0u8; STACK_SIZE];
  let child = clone(
    Box::new(|| executor::executor_main(request, &root, &inner_barrier)),
    &mut stack,
    CloneFlags::CLONE_NEWUSER
      | CloneFlags::CLONE_NEWPID
      | CloneFlags::CLONE_NEWNET
      | CloneFlags::CLONE_NEWNS
      | CloneFlags::CLONE_NEWUTS,
    Some(Signal::SIGCHLD as libc::c_int),
  )
  .map_err(|errno| SandCatError::fork(format!("Clone executor fails: {}", errno)))?;

  info!("Executor spawned (pid = {})", child);

  if let Err(err) = enroll_executor(&cgroup, child, &inner_barrier) {
    let _ = kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);
    return Err(err);
  }

  // The executor is pid 1 of its pid namespace: its descendants die with
  // it, so one blocking wait reaps everything we care about.
  let status = waitpid(child, None)?;
  let exit_code = match status {
    WaitStatus::Exited(_, code) => code,
    WaitStatus::Signaled(pid, signal, _) => {
      error!("Executor #{}. is killed by {}", pid, signal);
      255
    }
    _ => 255,
  };

  // Counters are final only after the executor has been reaped.
  let usage = cgroup.usage();
  let verdict = Verdict::classify(
    exit_code,
    usage.oom_killed,
    usage.time_ms,
    request.time_limit_ms,
  );
  info!(
    "Executor exited with {} -> {:?} ({} ms, {} MB)",
    exit_code, verdict, usage.time_ms, usage.memory_mb
  );

  let stdout_bytes = sandbox_fs.read_back("stdout");
  let stderr_bytes = sandbox_fs.read_back("stderr");
  let output_files = request
    .output_filenames
    .iter()
    .map(|filename| OutputFile {
      filename: filename.clone(),
      content: sandbox_fs.read_back(filename),
    })
    .collect();

  Ok(JudgeResult {
    verdict,
    time_ms: usage.time_ms,
    memory_mb: usage.memory_mb,
    stdout_bytes,
    stderr_bytes,
    output_files,
  })
}

/// Give the executor its identity and its limits before it may proceed:
/// uid/gid 65534 via its own user namespace map, membership of the cgroup
/// leaf. The barrier release publishes both.
///
/// Writing `/proc/<pid>` files from the parent side works because this
/// process still shares the host pid namespace; only the executor got a
/// new one.
fn enroll_executor(
  cgroup: &SandCatCgroup,
  child: Pid,
  barrier: &SandCatPipe,
) -> Result<(), SandCatError> {
  write_id_maps(child)?;
  cgroup.attach(child)?;
  barrier.release()
}

/// In a user namespace whose single mapping is `0 -> <driver uid>`, no
/// process can `setuid(65534)`: the id is unmapped. The drop to nobody is
/// done by mapping the executor's fresh user namespace as `65534 0 1`, so
/// it simply is uid/gid 65534 from the start.
fn write_id_maps(pid: Pid) -> Result<(), SandCatError> {
  let proc_dir = format!("/proc/{}", pid.as_raw());
  fs::write(format!("{}/setgroups", proc_dir), "deny")?;
  fs::write(format!("{}/uid_map", proc_dir), "65534 0 1")?;
  fs::write(format!("{}/gid_map", proc_dir), "65534 0 1")?;
  Ok(())
}
