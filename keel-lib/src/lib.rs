// SPDX-License-Identifier: GPL-2.0-only
pub mod agent;
pub mod bus;
pub mod config;
pub mod feed;
pub mod id;
pub mod model;
pub mod orchestrator;
pub mod runtime;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
