// SPDX-License-Identifier: GPL-2.0-only
use serde::{Deserialize, Serialize};

/// Location of the image config inside an application root filesystem.
pub const IMAGE_CONFIG_PATH: &str = "/keel/image.yaml";

/// Runtime configuration of an application image, written by the image
/// builder next to the application files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub workdir: Option<String>,
    /// `uid:gid` or a bare `uid` (gid defaults to the uid).
    pub user: Option<String>,
    /// Image defaults in `KEY=VALUE` form; metadata env overrides them.
    pub env: Vec<String>,
}

impl ImageConfig {
    /// Full argv: entrypoint followed by cmd.
    pub fn argv(&self) -> Vec<String> {
        self.entrypoint.iter().chain(self.cmd.iter()).cloned().collect()
    }

    pub fn workdir(&self) -> &str {
        self.workdir.as_deref().filter(|w| !w.is_empty()).unwrap_or("/")
    }

    /// Numeric (uid, gid) to run the application as. `None` keeps root.
    pub fn ids(&self) -> Result<Option<(u32, u32)>, String> {
        let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) else {
            return Ok(None);
        };
        let (uid, gid) = match user.split_once(':') {
            Some((u, g)) => (u, g),
            None => (user, user),
        };
        let uid = uid
            .parse::<u32>()
            .map_err(|_| format!("user '{user}' is not numeric uid[:gid]"))?;
        let gid = gid
            .parse::<u32>()
            .map_err(|_| format!("user '{user}' is not numeric uid[:gid]"))?;
        Ok(Some((uid, gid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_joins_entrypoint_and_cmd() {
        let cfg = ImageConfig {
            entrypoint: vec!["/bin/server".into()],
            cmd: vec!["--port".into(), "8080".into()],
            ..Default::default()
        };
        assert_eq!(cfg.argv(), vec!["/bin/server", "--port", "8080"]);
    }

    #[test]
    fn user_forms() {
        let mut cfg = ImageConfig::default();
        assert_eq!(cfg.ids().unwrap(), None);

        cfg.user = Some("1000:100".into());
        assert_eq!(cfg.ids().unwrap(), Some((1000, 100)));

        cfg.user = Some("65534".into());
        assert_eq!(cfg.ids().unwrap(), Some((65534, 65534)));

        cfg.user = Some("nobody".into());
        assert!(cfg.ids().is_err());
    }

    #[test]
    fn workdir_defaults_to_root() {
        let cfg = ImageConfig::default();
        assert_eq!(cfg.workdir(), "/");
    }
}
