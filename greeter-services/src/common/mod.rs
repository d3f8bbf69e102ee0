mod context;
mod panic;

pub use context::ContextService;
pub use panic::{CatchPanicError, CatchPanicService};

/// An accepted stream paired with its connection context.
pub type Accept<Stream, Ctx> = (Stream, Ctx);
