// SPDX-License-Identifier: GPL-2.0-only
use tracing_subscriber::{fmt, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_target(false).with_env_filter(filter).init();
}
