//! Command implementations for candiag

pub mod diag;
pub mod layers;
pub mod monitor;
pub mod networks;
pub mod signals;
pub mod trace;

pub use diag::diag;
pub use layers::layers;
pub use monitor::{monitor, parse_seconds, MonitorOptions};
pub use networks::networks;
pub use signals::signals;
pub use trace::trace;
