pub mod amg;
pub mod archive;
pub mod cli;
pub mod config;
pub mod control;
pub mod dupcheck;
pub mod error;
pub mod fd;
pub mod fifo;
pub mod logging;
pub mod msg;
pub mod options;
pub mod rename;
pub mod ruledb;
pub mod state;
pub mod timejob;
pub mod util;
pub mod workers;

pub use error::DeliveryError;
pub use error::StateError;
