pub mod compose;
pub mod dispatcher;
pub mod error;
pub mod jwt;
#[cfg(test)]
mod mock;
pub mod payload;
pub mod store;
pub mod transport;

pub use compose::*;
pub use dispatcher::*;
pub use error::*;
pub use jwt::*;
pub use payload::*;
pub use store::*;
pub use transport::*;
