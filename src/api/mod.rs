//! Client-facing API surfaces

pub mod client_http;
