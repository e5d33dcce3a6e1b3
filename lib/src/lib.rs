#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod alignment;
pub mod klog;
pub mod park;
pub mod spinlock;

#[doc(hidden)]
pub use paste;

pub use alignment::{align_down_u32, align_down_usize, align_up_u32, align_up_usize};
pub use alignment::{align_down_usize as align_down, align_up_usize as align_up};
pub use klog::{
    KlogLevel, klog_clear_backend, klog_get_level, klog_init, klog_is_enabled,
    klog_register_backend, klog_set_level,
};
pub use park::{PARK_CAPACITY, ParkError, ParkTable, WaitOutcome, WakeToken};
pub use spinlock::{SpinMutex, SpinMutexGuard};
