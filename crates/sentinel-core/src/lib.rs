pub mod config;
pub mod events;
pub mod layout;
pub mod types;

pub use config::*;
pub use events::*;
pub use layout::*;
pub use types::*;
