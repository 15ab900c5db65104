pub mod types;
pub mod protocol;
pub mod error;
pub mod pcm;

pub use types::*;
pub use protocol::*;
pub use error::*;
