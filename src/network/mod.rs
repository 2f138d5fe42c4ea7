pub mod poll;

pub use poll::Poller;
