pub mod entities;
pub mod ports;
pub mod repositories;
pub mod sqlx_impls;
pub mod state;

pub use entities::*;
pub use ports::*;
pub use repositories::*;
pub use state::*;
pub use taskengine_core::{SchedulerError, SchedulerResult};
