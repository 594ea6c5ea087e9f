// SPDX-License-Identifier: GPL-2.0-only
use anyhow::{bail, Context, Result};
use keel_protocol::MetadataResponse;
use std::time::Duration;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Trade the one-time token for the application environment. Anything
/// but a 200 with a well-formed body is an error.
pub async fn fetch_env(url: &str, token: &str) -> Result<Vec<String>> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .context("cannot build HTTP client")?;

    let response = client
        .get(url)
        .query(&[("token", token)])
        .send()
        .await
        .with_context(|| format!("metadata request to {url} failed"))?;

    let status = response.status();
    if !status.is_success() {
        bail!("metadata endpoint {url} returned {status}");
    }
    let body: MetadataResponse = response
        .json()
        .await
        .context("metadata response is not valid JSON")?;
    Ok(body.env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn returns_env_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/metadata"))
            .and(query_param("token", "tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "env": ["A=1", "B=2"] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let env = fetch_env(&format!("{}/v1/metadata", server.uri()), "tok")
            .await
            .unwrap();
        assert_eq!(env, vec!["A=1", "B=2"]);
    }

    #[tokio::test]
    async fn forbidden_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = fetch_env(&format!("{}/v1/metadata", server.uri()), "spent")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn malformed_body_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        assert!(fetch_env(&format!("{}/v1/metadata", server.uri()), "tok")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_fatal() {
        // Nothing listens on port 9 of localhost
        assert!(fetch_env("http://127.0.0.1:9/v1/metadata", "tok").await.is_err());
    }
}
