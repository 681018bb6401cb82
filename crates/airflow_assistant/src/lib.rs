pub mod agent;
pub mod chat;
pub mod cli;
pub mod config;
pub mod logging;
pub mod mcp;
pub mod tools;
