pub mod common;
pub mod http;
pub mod tls;
