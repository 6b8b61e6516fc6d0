pub mod display;
pub mod input;
pub mod scheduler;
pub mod stats;
pub mod utils;
