// SPDX-License-Identifier: GPL-2.0-only
//! Wire types shared by the Keel host and the guest init.
//!
//! Everything here crosses the VM boundary: the boot configuration
//! handed to the guest kernel, the metadata endpoint response and the
//! image configuration baked into application root filesystems.

pub mod boot;
pub mod image;
pub mod metadata;

pub use boot::{BootConfig, BootConfigError};
pub use image::{ImageConfig, IMAGE_CONFIG_PATH};
pub use metadata::{MetadataResponse, METADATA_PATH};
