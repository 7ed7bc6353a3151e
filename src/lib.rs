#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use crate::config::ApplicationConfig;
pub use crate::entrypoint::entrypoint;

mod acme;
mod admin;
mod cert_delay;
mod certificates;
mod config;
mod directory;
mod droppable_handle;
mod entrypoint;
mod error;
mod fabrics;
mod health;
mod http;
mod inspector;
mod listener;
mod plain_http;
mod routes;
mod tls;
