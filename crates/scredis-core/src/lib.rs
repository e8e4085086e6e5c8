//! # scredis-core
//!
//! Host-side building blocks and Linux isolation primitives for the
//! scredis launcher.
//!
//! - **IP pool**: persistent, lock-protected address leases.
//! - **Bridge**: idempotent provisioning of the shared host bridge.
//! - **Spec**: synthesis and persistence of the container specification.
//! - **Rootfs**: per-launch extraction of the bundled root filesystem.
//! - **Namespaces, cgroups, filesystem, capabilities**: the primitives the
//!   native runtime assembles a container from.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! `// SAFETY:` documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bridge;
pub mod capability;
pub mod cgroup;
pub mod filesystem;
pub mod ippool;
pub mod namespace;
pub mod rootfs;
pub mod spec;
