pub mod classify;
pub mod error;
pub mod marker;
pub mod observer;
pub mod parser;
pub mod telemetry;
pub mod watch;

pub use classify::*;
pub use error::*;
pub use marker::*;
pub use observer::*;
pub use parser::*;
pub use telemetry::*;
