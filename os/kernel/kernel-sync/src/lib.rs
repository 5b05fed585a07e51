//! # Kernel synchronization primitives
//!
//! * [`SpinLock`]: test-and-test-and-set lock guarding a value
//! * [`SyncOnceCell`]: one-time initialization for process-wide singletons
//! * [`Rendezvous`]: countdown an initiating CPU spins on until every
//!   participant has checked in

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod rendezvous;
mod spin_lock;
mod sync_once_cell;

pub use rendezvous::Rendezvous;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
