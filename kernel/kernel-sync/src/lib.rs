//! # Kernel synchronization primitives

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod once;
mod spin_lock;

pub use once::SyncOnceCell;
pub use spin_lock::SpinLock;
