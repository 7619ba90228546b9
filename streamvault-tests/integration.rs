//! Integration tests for streamvault
//!
//! These tests verify the interaction between the chunk store, fetch
//! worker pool, and stream coordinator: shared in-flight downloads,
//! byte-exact reconstruction, eviction under budget pressure, cache
//! restore across restarts, and cleanup when requests are abandoned.

#[path = "integration/common.rs"]
mod common;

#[path = "integration/scenarios.rs"]
mod scenarios;

#[path = "integration/concurrency.rs"]
mod concurrency;

#[path = "integration/eviction.rs"]
mod eviction;

#[path = "integration/restore.rs"]
mod restore;

#[path = "integration/cleanup.rs"]
mod cleanup;
