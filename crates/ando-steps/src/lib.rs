pub mod container_exec;
pub mod host;

pub use container_exec::ContainerExecutor;
pub use host::HostExecutor;
