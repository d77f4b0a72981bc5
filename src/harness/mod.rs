//! # Probe Harness
//!
//! The checklist side of the tool: what to run against a device and how to
//! report it.
//!
//! ```text
//! harness/
//! ├── probe.rs     - subscribe to status topics, publish a request, collect replies
//! ├── scenario.rs  - named scenarios, run sequentially, one session each
//! └── report.rs    - verdicts, per-scenario results and the summary table
//! ```

pub mod probe;
pub mod report;
pub mod scenario;

pub use probe::{run_probe, ProbeReport, ProbeRequest, PublishRequest};
pub use report::{ConsoleReporter, ScenarioResult, Summary, TestStatus, Verdict};
pub use scenario::{Scenario, ScenarioRunner};
