//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own canvas state, locking, history and persistence so
//! route handlers stay focused on protocol translation and actor plumbing.
//! Change events leave through the bus; services never write to sockets.

pub mod bus;
pub mod canvas;
pub mod debounce;
pub mod dispatch;
pub mod history;
pub mod lock;
pub mod persistence;
pub mod store;
