//! Docker-backed container runtime and service registry.

pub mod cli;
pub mod inspect;
pub mod runtime;
pub mod services;

pub use cli::DockerCli;
pub use runtime::DockerRuntime;
pub use services::DockerServices;
