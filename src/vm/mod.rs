pub use adjunct::Adjunct;
pub use machine::Arg;
pub use machine::Args;
pub use machine::Function;
pub use machine::Guard;
pub use machine::Handle;
pub use machine::Machine;

pub use promise::Promises;
pub use promise::Resolved;
pub use promise::Resolver;
pub use promise::Settled;

mod adjunct;
mod context;
mod inspect;
mod machine;
mod promise;
