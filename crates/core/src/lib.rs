pub mod clock;
pub mod config;
pub mod errors;
pub mod logging;

pub use clock::{Clock, SystemClock};
pub use config::AppConfig;
pub use errors::*;
pub use logging::init_logging;
