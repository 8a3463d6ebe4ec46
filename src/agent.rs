//! Per-node agents run as Jobs by the controller.

pub mod extract;
pub mod load;
pub mod progress;
