pub use timeout::Timeout;

pub mod timeout;
