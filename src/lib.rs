pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod output_view;
pub mod progress;
pub mod running;
pub mod session;
pub mod timer;
