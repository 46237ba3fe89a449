//! Vesta-style repository core and SRPC transport.
//!
//! The crate is organized leaf-first: pure value calculus (`longid`,
//! `attribs`), wire-level primitives (`wire`, `srpc`), client/server
//! glue (`pool`, `dispatch`), the repository data model (`source`,
//! `access`), and the two higher-level protocols built on top of it
//! (`surrogate`, `atomic`).

pub mod access;
pub mod atomic;
pub mod attribs;
pub mod config;
pub mod dispatch;
pub mod longid;
pub mod pool;
pub mod repository;
pub mod source;
pub mod srpc;
pub mod surrogate;
pub mod wire;
