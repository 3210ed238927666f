pub mod config;
pub mod executor;
pub mod flow;
pub mod flow_commands;
pub mod logger;
pub mod message;
pub mod node;
pub mod ports;
pub mod process;
pub mod schema;
pub mod util;
