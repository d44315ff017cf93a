pub mod classify;
pub mod options;
pub mod orchestrator;
pub mod report;
pub mod source;

pub use options::RunOptions;
pub use orchestrator::{run, CaseError, FatalError};
pub use report::RunReport;
