pub mod client;
pub mod imaging;
pub mod poll;
pub mod workflow;

pub use client::HttpPainter;
pub use poll::PollPolicy;
pub use workflow::{run_draw, DrawChannel, DrawNotice, DrawOutcome, DrawSettings};
