pub mod error;
pub mod handler_utils;
pub mod requests;
pub mod server;
