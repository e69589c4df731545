//! CLI command implementations

pub mod config;
pub mod get;
pub mod lookup;
pub mod pin;
pub mod publish;
pub mod put;
pub mod status;

pub use config::execute as config;
pub use get::execute as get;
pub use lookup::execute as lookup;
pub use pin::execute as pin;
pub use publish::execute as publish;
pub use put::execute as put;
pub use status::execute as status;
