pub mod builtin;
pub mod output;
pub mod registry;

pub use output::Sinks;
pub use registry::{Collaborators, ExecutorRegistry, Registration};
