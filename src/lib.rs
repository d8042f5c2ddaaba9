//! User-space translation layer presenting handle-based, status-reporting
//! asynchronous file I/O on top of POSIX descriptors and an out-of-process
//! coordination service.
//!
//! The service owns every piece of cross-process state: directory watches,
//! byte-range locks, device queues, shared handle metadata. This crate is the
//! calling side: it translates platform errors into the native status
//! vocabulary, classifies descriptors into device types, dispatches control
//! codes, converts change-notification batches, and arbitrates byte-range
//! locks through the service.

pub mod aio;
pub mod config;
pub mod file;
pub mod fsctl;
pub mod handle;
pub mod ioctl;
pub mod lock;
pub mod notify;
pub mod server;
pub mod status;
pub mod volume;
