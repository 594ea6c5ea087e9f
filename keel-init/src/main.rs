// SPDX-License-Identifier: GPL-2.0-only
mod boot;
mod env;
mod guest;
mod metadata;
mod net;
mod rootfs;

use boot::{boot, Layout};
use guest::LinuxGuest;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("keel-init starting");

    // Only returns on failure; the kernel panics when PID 1 exits.
    if let Err(e) = boot(&LinuxGuest, &Layout::default()).await {
        eprintln!("keel-init: fatal: {e:#}");
        std::process::exit(1);
    }
}
