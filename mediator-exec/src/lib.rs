//! Exec and package brokers: the two hardened mediation paths that always
//! require `approve-each`, sharing one subprocess runner.

mod broker;
mod package;
mod runner;

pub use broker::ExecBroker;
pub use package::PackageBroker;
pub use package::ParsedPackageCommand;
pub use package::build_command;
pub use package::parse_package_command;
pub use runner::DEFAULT_TIMEOUT;
pub use runner::RunOutput;
pub use runner::run_shell;
