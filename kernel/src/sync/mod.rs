mod once;
mod spin_lock;

pub use self::{
    once::Once,
    spin_lock::{SpinLock, SpinLockGuard},
};
