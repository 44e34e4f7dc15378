//! The delta xDS multiplexer and the per-type state it is built from.

pub mod ack_queue;
pub mod config;
pub mod mux;
pub mod subscription_state;
pub mod type_url;
pub mod watch_map;
