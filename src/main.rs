use std::env;
use std::path::PathBuf;

use clap::Parser;
use flexi_logger::{FileSpec, Logger};
use log::{error, info};

use nix::libc::{STDIN_FILENO, STDOUT_FILENO};
use nix::sys::signal::{signal, SigHandler, Signal};

use sandcat::{default_format, run, JudgeRequest, JudgeResult, SandCatError, SandCatExit, Verdict};

#[derive(Parser, Debug)]
#[command(author, version, about = "Single-shot sandboxed code executor", long_about = None)]
struct Cli {
  #[arg(long, help = "Directory for log files [default: $SANDCAT_LOG or ./logs/]")]
  log_dir: Option<PathBuf>,
}

fn bootstrap(cli: Cli) -> Result<Verdict, SandCatError> {
  let log_dir = cli
    .log_dir
    .unwrap_or_else(|| PathBuf::from(env::var("SANDCAT_LOG").unwrap_or("./logs/".into())));

  Logger::try_with_str("sandcat=info")?
    .log_to_file(
      FileSpec::default()
        .directory(log_dir)
        .basename("sandcat")
        .discriminant(format!(
          "{}",
          chrono::offset::Local::now().format("%Y-%m-%d")
        ))
        .suppress_timestamp(),
    )
    .append()
    .format_for_files(default_format)
    .start()?;

  info!("Start running sandcat");

  // A broken downstream must not kill the driver before the response
  // frame is attempted.
  unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;

  let mut request = JudgeRequest::read_from(STDIN_FILENO)?;
  request.validate()?;
  info!(
    "Judge request accepted (sandbox = {}, {} ms, {} MB)",
    request.sandbox_id, request.time_limit_ms, request.memory_limit_mb
  );

  let result = run(&request)?;
  result.write_to(STDOUT_FILENO)?;

  info!("Running sandcat finished (verdict = {:?})", result.verdict);
  Ok(result.verdict)
}

fn main() -> SandCatExit {
  let cli = Cli::parse();

  match bootstrap(cli) {
    Ok(Verdict::Uke) => SandCatExit::Uke,
    Ok(_) => SandCatExit::Ok,
    Err(err) => {
      error!("Running sandcat failed: {}", err);
      let result = JudgeResult::internal_error(&err);
      let _ = result.write_to(STDOUT_FILENO);
      SandCatExit::Err(err)
    }
  }
}
