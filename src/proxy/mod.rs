//! The intermediaries between public clients and the execution service
//!
//! Every hop is an actix-web server holding immutable configuration and a
//! pooled client for its upstream; requests are independent pipeline stages.

pub mod bridge;
pub mod edge;
pub mod forward;
pub mod gateway;
pub mod keys;
