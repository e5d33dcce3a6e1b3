//! NetSys capability ABI types
//!
//! Canonical definitions shared between the network domain and its clients:
//! request opcodes, result codes, and the fixed limits a client can rely on.
//! Values are plain integers so they can travel in IPC message words.

#![no_std]
#![forbid(unsafe_code)]

#[cfg(test)]
extern crate std;

pub mod net;

pub use net::*;
