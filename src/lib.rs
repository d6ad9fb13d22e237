pub use context::{InputFile, JudgeRequest, JudgeResult, OutputFile, Verdict};
pub use driver::run;
pub use error::{SandCatError, SandCatExit};
pub use utils::default_format;

mod cgroup;
mod context;
mod driver;
mod error;
mod executor;
mod mount;
mod pipe;
pub mod proto;
mod sandbox;
mod utils;
