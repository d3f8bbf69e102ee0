pub mod connection_persistence;
pub mod hello;

pub use connection_persistence::ConnectionReuseHandler;
pub use hello::HelloWorldHandler;
