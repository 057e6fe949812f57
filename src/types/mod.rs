pub mod notification;
pub mod queue;
pub mod strategy;
pub mod trading;

pub use notification::*;
pub use queue::*;
pub use strategy::*;
pub use trading::*;
