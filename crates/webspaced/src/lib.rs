//! webspaced: per-user webspaces backed by LXD.
//!
//! Each user gets one container. Its metadata (forwarded ports, extra
//! domains, config) lives in the instance's own config, so LXD is the only
//! store. The daemon exposes a small HTTP API on a Unix socket and trusts
//! the kernel's peer credentials for authentication.

pub mod api;
pub mod config;
pub mod dns;
pub mod events;
pub mod identity;
pub mod lxd;
pub mod retry;
pub mod webspace;
