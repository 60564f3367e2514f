pub use bridge::Bridge;
pub use defer::Deferred;
pub use error::Error;
pub use vm::Machine;

pub mod bridge;
pub mod defer;
pub mod ex;
pub mod timer;
pub mod vm;

mod error;
