//! Launch lifecycle for the scredis launcher.
//!
//! [`bootstrap`] drives the host stage, [`init`] the in-container stage;
//! the two only share the spec file, three environment variables, and the
//! [`handshake`] socket.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bootstrap;
pub mod handshake;
pub mod init;
pub mod relay;
pub mod rollback;
pub mod runtime;
