/*
 * Copyright (C) 2026 Gantry contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Thin REST client for the MAAS region controller.
//!
//! Speaks the 2.0 API with OAuth 1.0 PLAINTEXT signing, the scheme MAAS
//! API keys are issued for. Each call is one request; retries are left
//! to the polling loops that sit above this layer.

use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::de::DeserializeOwned;
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::maas::api::{
    CommissionParams, DeployParams, Machine, MachineApi, MachineStatus, ReleaseParams,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_LIMIT: usize = 500;

/// Credentials in the `consumer:token:secret` form MAAS hands out.
#[derive(Debug, Clone)]
struct ApiKey {
    consumer: String,
    token: String,
    secret: String,
}

impl ApiKey {
    fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.trim().split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(consumer), Some(token), Some(secret), None)
                if !consumer.is_empty() && !token.is_empty() && !secret.is_empty() =>
            {
                Ok(Self {
                    consumer: consumer.to_string(),
                    token: token.to_string(),
                    secret: secret.to_string(),
                })
            }
            _ => Err(Error::validation(
                "MAAS API key must have the form consumer:token:secret",
            )),
        }
    }

    /// OAuth 1.0 PLAINTEXT header. The consumer secret is empty for
    /// MAAS keys, so the signature is `&<token_secret>`.
    fn authorization(&self) -> String {
        format!(
            "OAuth oauth_version=\"1.0\", oauth_signature_method=\"PLAINTEXT\", \
             oauth_consumer_key=\"{}\", oauth_token=\"{}\", oauth_signature=\"&{}\", \
             oauth_nonce=\"{}\", oauth_timestamp=\"{}\"",
            self.consumer,
            self.token,
            self.secret,
            Uuid::new_v4(),
            Utc::now().timestamp()
        )
    }
}

/// HTTP client bound to one region controller and one API key.
#[derive(Debug, Clone)]
pub struct MaasClient {
    http: reqwest::Client,
    base: Url,
    key: ApiKey,
}

impl MaasClient {
    /// Creates a client for the given endpoint, conventionally
    /// `http://<host>:5240/MAAS/`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed endpoint or API key,
    /// or an internal error if the HTTP client cannot be built.
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self> {
        let mut base = Url::parse(endpoint)
            .map_err(|e| Error::validation(format!("invalid MAAS endpoint {endpoint:?}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::validation(format!(
                "MAAS endpoint must be http or https, got {:?}",
                base.scheme()
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base,
            key: ApiKey::parse(api_key)?,
        })
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        Ok(self
            .base
            .join(&format!("api/2.0/{path}"))
            .context("joining MAAS API path")?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.api_url(path)?;
        let response = self
            .http
            .get(url.clone())
            .header(AUTHORIZATION, self.key.authorization())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| Error::upstream(format!("request to {url} failed: {e}")))?;
        Self::parse_response(response).await
    }

    async fn post_op<T: DeserializeOwned>(
        &self,
        path: &str,
        op: &str,
        form: &[(&str, String)],
    ) -> Result<T> {
        let mut url = self.api_url(path)?;
        url.query_pairs_mut().append_pair("op", op);
        let response = self
            .http
            .post(url.clone())
            .header(AUTHORIZATION, self.key.authorization())
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::upstream(format!("request to {url} failed: {e}")))?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let trimmed = body.trim();
            let message = if trimmed.is_empty() {
                status.to_string()
            } else {
                trimmed.chars().take(ERROR_BODY_LIMIT).collect()
            };
            return Err(Error::upstream_status(status.as_u16(), message));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::upstream(format!("invalid JSON from MAAS: {e}")))
    }
}

/// Rejects ids that could splice extra path segments into a request.
fn validate_system_id(system_id: &str) -> Result<()> {
    let well_formed = !system_id.is_empty()
        && system_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if well_formed {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid system id: {system_id:?}"
        )))
    }
}

/// Converts an upstream 404 into a not-found for the named machine.
fn map_missing_machine(error: Error, system_id: &str) -> Error {
    match error {
        Error::Upstream {
            status: Some(404), ..
        } => Error::not_found(format!("machine {system_id}")),
        other => other,
    }
}

impl MachineApi for MaasClient {
    async fn list_machines(&self) -> Result<Vec<Machine>> {
        self.get_json("machines/").await
    }

    async fn get_machine(&self, system_id: &str) -> Result<Machine> {
        validate_system_id(system_id)?;
        self.get_json(&format!("machines/{system_id}/"))
            .await
            .map_err(|e| map_missing_machine(e, system_id))
    }

    async fn machine_status(&self, system_id: &str) -> Result<MachineStatus> {
        let machine = self.get_machine(system_id).await?;
        Ok(machine.status())
    }

    async fn deploy_machine(&self, system_id: &str, params: &DeployParams) -> Result<Machine> {
        validate_system_id(system_id)?;
        let mut form: Vec<(&str, String)> = Vec::new();
        if let Some(series) = &params.distro_series {
            form.push(("distro_series", series.clone()));
        }
        if let Some(kernel) = &params.hwe_kernel {
            form.push(("hwe_kernel", kernel.clone()));
        }
        if let Some(user_data) = &params.user_data {
            form.push(("user_data", user_data.clone()));
        }
        self.post_op(&format!("machines/{system_id}/"), "deploy", &form)
            .await
            .map_err(|e| map_missing_machine(e, system_id))
    }

    async fn commission_machine(
        &self,
        system_id: &str,
        params: &CommissionParams,
    ) -> Result<Machine> {
        validate_system_id(system_id)?;
        let form: Vec<(&str, String)> = vec![
            ("enable_ssh", i32::from(params.enable_ssh).to_string()),
            ("skip_networking", i32::from(params.skip_networking).to_string()),
            ("skip_storage", i32::from(params.skip_storage).to_string()),
        ];
        self.post_op(&format!("machines/{system_id}/"), "commission", &form)
            .await
            .map_err(|e| map_missing_machine(e, system_id))
    }

    async fn release_machine(&self, system_id: &str, params: &ReleaseParams) -> Result<Machine> {
        validate_system_id(system_id)?;
        let mut form: Vec<(&str, String)> = Vec::new();
        if let Some(comment) = &params.comment {
            form.push(("comment", comment.clone()));
        }
        if params.erase {
            form.push(("erase", "1".to_string()));
        }
        self.post_op(&format!("machines/{system_id}/"), "release", &form)
            .await
            .map_err(|e| map_missing_machine(e, system_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for brevity")]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_api_key_parses_three_parts() -> Result<()> {
        let key = ApiKey::parse("AbCdEf:GhIjKl:MnOpQr")?;
        assert_eq!(key.consumer, "AbCdEf");
        assert_eq!(key.token, "GhIjKl");
        assert_eq!(key.secret, "MnOpQr");
        Ok(())
    }

    #[test]
    fn test_api_key_rejects_malformed_input() {
        for raw in ["", "one:two", "a:b:c:d", "a::c"] {
            assert!(ApiKey::parse(raw).is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn test_authorization_header_shape() -> Result<()> {
        let key = ApiKey::parse("consumer:token:secret")?;
        let header = key.authorization();
        assert!(header.starts_with("OAuth oauth_version=\"1.0\""));
        assert!(header.contains("oauth_signature_method=\"PLAINTEXT\""));
        assert!(header.contains("oauth_consumer_key=\"consumer\""));
        assert!(header.contains("oauth_token=\"token\""));
        assert!(header.contains("oauth_signature=\"&secret\""));
        assert!(header.contains("oauth_nonce="));
        Ok(())
    }

    #[test]
    fn test_endpoint_gains_trailing_slash() -> Result<()> {
        let client = MaasClient::new("http://maas.example:5240/MAAS", "a:b:c")?;
        let url = client.api_url("machines/")?;
        assert_eq!(url.as_str(), "http://maas.example:5240/MAAS/api/2.0/machines/");
        Ok(())
    }

    #[test]
    fn test_endpoint_rejects_unknown_scheme() {
        assert!(MaasClient::new("ftp://maas.example/MAAS/", "a:b:c").is_err());
        assert!(MaasClient::new("not a url", "a:b:c").is_err());
    }

    #[test]
    fn test_system_id_validation() {
        assert!(validate_system_id("4y3h7n").is_ok());
        assert!(validate_system_id("node-01_b").is_ok());
        assert!(validate_system_id("").is_err());
        assert!(validate_system_id("../region").is_err());
        assert!(validate_system_id("abc/def").is_err());
    }
}
