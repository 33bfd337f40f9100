pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod http_client;
pub mod library;
pub mod model;
pub mod normalizer;
pub mod observer;
pub mod session;
pub mod telemetry;
