pub mod geo;
pub mod entity;
pub mod gate;
pub mod remote;
pub mod store;
pub mod listener;
pub mod cache;
pub mod annotate;
pub mod sampler;
pub mod coordinator;
pub mod config;
