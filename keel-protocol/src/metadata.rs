// SPDX-License-Identifier: GPL-2.0-only
use serde::{Deserialize, Serialize};

/// Path of the metadata endpoint served on the node's gateway address.
pub const METADATA_PATH: &str = "/v1/metadata";

/// Body of a successful metadata fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataResponse {
    /// Environment entries in `KEY=VALUE` form.
    pub env: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_env_list() {
        let body = r#"{"env": ["DATABASE_URL=postgres://db", "PORT=8080"]}"#;
        let resp: MetadataResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.env.len(), 2);
        assert_eq!(resp.env[1], "PORT=8080");
    }
}
