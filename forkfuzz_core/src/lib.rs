pub mod config;
pub mod executor;
pub mod generator;
pub mod handler;
pub mod input;
pub mod ipc;
pub mod suite;
pub mod sys;
pub mod worker;

pub use config::{ConfigError, FuzzerConfig};
pub use executor::{
    ExecutionStatus, Executor, ExecutorError, ExecutorOptions, LimitScope, RunSummary,
    ShutdownSignal,
};
pub use generator::Generator;
pub use handler::{ConsoleHandler, FailureReport, FileOutputHandler, Handler, HandlerError};
pub use input::Input;
pub use suite::{Test, TestSuite};
