pub mod agent;
pub mod config;
pub mod contracts;
pub mod dag;
pub mod errors;
pub mod events;
pub mod gates;
pub mod hail;
pub mod orchestrator;
pub mod phase;
pub mod plan;
pub mod scheduler;
pub mod signals;
pub mod stream;
pub mod tracker;
