pub mod cli;
pub mod config;
pub mod runtime;

mod http_api;
mod player;
mod surface;
