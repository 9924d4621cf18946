//! Task-graph scheduler: DAG construction, dependency fingerprinting, and
//! serial/parallel/grid runners.

pub mod context;
pub mod dag;
pub mod dep;
pub mod error;
pub mod exec;
pub mod reporter;
pub mod runner;
pub mod skip;
pub mod task;
pub mod template;

pub use context::{RunContext, TaskResult};
pub use dag::{build, Dag, DeclaredTask};
pub use dep::{Dep, DepRegistry, Trackable};
pub use error::{BuildError, CompareError, RunError, TemplateError};
pub use reporter::{ConsoleReporter, Reporter};
pub use runner::{dry::DryRunner, grid::GridRunner, parallel::ParallelLocalRunner, serial::SerialLocalRunner, Runner};
pub use skip::SkipStore;
pub use task::{Action, Task};
