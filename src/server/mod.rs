//! HTTP front door

mod http;

pub use http::{run, AppState};
