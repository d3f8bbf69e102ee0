mod error;
pub use error::{AnyError, AnyResult};

pub mod config;
pub mod context;
pub mod http;
pub mod listener;
pub mod orchestrator;

pub(crate) mod sealed {
    pub trait SealedT<T> {}
}
