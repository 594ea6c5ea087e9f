// SPDX-License-Identifier: GPL-2.0-only
use crate::id::Id;
use serde::{Deserialize, Serialize};

/// An application image. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: Id,
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: String,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

impl Image {
    /// `registry/repository:tag`
    pub fn reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }

    /// Name of the ext4 file holding this image's root filesystem.
    /// `sha256:ab..` becomes `sha256-ab...ext4`.
    pub fn file_name(&self) -> String {
        format!("{}.ext4", self.digest.replace(':', "-"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateImageParams {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_and_file_name() {
        let image = Image {
            id: Id::from_i64(1),
            registry: "registry.keel.dev".into(),
            repository: "acme/web".into(),
            tag: "v2".into(),
            digest: "sha256:feedface".into(),
            created_at: 0,
            deleted_at: None,
        };
        assert_eq!(image.reference(), "registry.keel.dev/acme/web:v2");
        assert_eq!(image.file_name(), "sha256-feedface.ext4");
    }
}
