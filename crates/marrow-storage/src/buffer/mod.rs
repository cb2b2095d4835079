//! Buffer pool: a fixed set of in-memory frames caching disk pages.

mod frame;
mod pool;

pub use frame::Frame;
pub use pool::BufferPool;
