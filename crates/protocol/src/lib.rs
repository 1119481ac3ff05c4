pub mod config;
pub mod envelope;
pub mod input;
pub mod messages;
pub mod monitor;

pub use config::*;
pub use envelope::*;
pub use input::*;
pub use messages::*;
pub use monitor::*;
