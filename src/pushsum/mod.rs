pub mod cluster;
pub mod coordinator;
pub mod init;
pub mod ledger;
pub mod message;
pub mod processor;
pub mod reader;
pub mod state;

pub use cluster::*;
pub use coordinator::*;
pub use init::*;
pub use ledger::*;
pub use message::*;
pub use processor::*;
pub use reader::*;
pub use state::*;
