//! HTTP API: routing, authentication and request/response mapping for the
//! JTD pipeline.

pub mod app;
pub mod authz;
pub mod context;
pub mod middleware;
