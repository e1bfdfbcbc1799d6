pub mod access;
pub mod api;
pub mod canvas;
pub mod config;
pub mod pipeline;
pub mod worker;
