//! Relational store access
//!
//! The pool is opened read-only at the session level, independent of the
//! translator's textual checks.

pub mod connection;

pub use connection::connect_read_only;
