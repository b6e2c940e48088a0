pub mod chat_store;
pub mod chat_stream;
pub mod config;
pub mod constants;
pub mod conversation;
pub mod ids;
pub mod message;
pub mod tools;
pub mod turn;
