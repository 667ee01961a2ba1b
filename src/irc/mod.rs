pub mod channel;
pub mod client;
pub mod codec;
pub mod command;
pub mod reply;
pub mod server;
