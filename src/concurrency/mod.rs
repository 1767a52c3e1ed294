pub mod key_lock;
pub mod maintenance_lock;

pub use key_lock::{KeyGuard, KeyedLocks};
pub use maintenance_lock::{MaintenanceLock, MaintenanceLockGuard};
