mod lpm;
mod pool;
mod rlimit;

pub use lpm::summarize_address_range;
pub use lpm::Prefix;
pub use pool::ObjectPool;
pub use pool::Pooled;
pub use rlimit::MemlockGuard;
