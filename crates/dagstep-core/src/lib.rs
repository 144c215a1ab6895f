pub mod coerce;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod router;
pub mod traits;
pub mod types;

pub use config::{AmbientDefaults, EngineConfig};
pub use error::{DagstepError, ErrorKind, Result};
pub use lifecycle::RunControl;
pub use router::{RouterConfig, RouterInput, RouterMode, RouterResult};
pub use traits::*;
pub use types::*;
