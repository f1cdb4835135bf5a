pub mod process;

pub use process::{run_with_timeout, stderr_text, ProcessError};
