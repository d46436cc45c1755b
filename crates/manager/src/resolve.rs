use std::collections::HashMap;

use url::Url;

/// Failures mapping a content URI to a transcodable claim.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("stream not found")]
    StreamNotFound,
    #[error("stream has no signing channel")]
    NoSigningChannel,
    #[error("stream doesn't have source data")]
    NoSource,
    #[error("resolver request failed")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected resolver response: {0}")]
    Protocol(String),
}

/// Resolves a content URI into claim metadata. The network resolver is an
/// external collaborator; tests substitute their own implementations.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, uri: &str) -> Result<Claim, ResolveError>;
}

/// Claim metadata as returned by the resolver.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Claim {
    #[serde(default)]
    pub canonical_url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub normalized_name: String,
    #[serde(default)]
    pub claim_id: String,
    pub signing_channel: Option<SigningChannel>,
    pub value: Option<ClaimValue>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SigningChannel {
    #[serde(default)]
    pub canonical_url: String,
    #[serde(default)]
    pub meta: ChannelMeta,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ChannelMeta {
    /// Decimal token amount, e.g. `"1034.75"`.
    #[serde(default)]
    pub support_amount: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ClaimValue {
    pub source: Option<ClaimSource>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ClaimSource {
    /// Hex-encoded stream fingerprint (96 characters).
    #[serde(default)]
    pub sd_hash: String,
}

impl Claim {
    /// Floor of the signing channel's support amount, in whole tokens.
    pub fn support_amount(&self) -> i64 {
        self.signing_channel
            .as_ref()
            .and_then(|ch| ch.meta.support_amount.parse::<f64>().ok())
            .map(|amount| amount.floor() as i64)
            .unwrap_or_default()
    }
}

/// JSON-RPC client for the network resolver API.
pub struct JsonRpcResolver {
    client: reqwest::Client,
    endpoint: Url,
}

#[derive(serde::Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: RpcParams<'a>,
}

#[derive(serde::Serialize)]
struct RpcParams<'a> {
    urls: [&'a str; 1],
}

#[derive(serde::Deserialize)]
struct RpcResponse {
    result: Option<HashMap<String, serde_json::Value>>,
    error: Option<serde_json::Value>,
}

impl JsonRpcResolver {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait::async_trait]
impl Resolver for JsonRpcResolver {
    #[tracing::instrument(skip(self))]
    async fn resolve(&self, uri: &str) -> Result<Claim, ResolveError> {
        let response: RpcResponse = self
            .client
            .post(self.endpoint.clone())
            .json(&RpcRequest {
                method: "resolve",
                params: RpcParams { urls: [uri] },
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(ResolveError::Protocol(error.to_string()));
        }
        let Some(raw) = response.result.and_then(|mut r| r.remove(uri)) else {
            return Err(ResolveError::StreamNotFound);
        };
        // Unresolvable URIs come back as `{"error": {...}}` entries.
        if raw.get("error").is_some() {
            return Err(ResolveError::StreamNotFound);
        }

        let claim: Claim = serde_json::from_value(raw)
            .map_err(|err| ResolveError::Protocol(err.to_string()))?;
        if claim.canonical_url.is_empty() {
            return Err(ResolveError::StreamNotFound);
        }
        Ok(claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_json() -> serde_json::Value {
        serde_json::json!({
            "canonical_url": "lbry://@Chan#f/stream#1",
            "name": "stream",
            "normalized_name": "stream",
            "claim_id": "1f0a",
            "signing_channel": {
                "canonical_url": "lbry://@Chan#f",
                "meta": {"support_amount": "1034.75"}
            },
            "value": {"source": {"sd_hash": "ab".repeat(48)}}
        })
    }

    #[test]
    fn claim_deserializes() {
        let claim: Claim = serde_json::from_value(claim_json()).unwrap();
        assert_eq!(claim.canonical_url, "lbry://@Chan#f/stream#1");
        assert_eq!(claim.support_amount(), 1034);
        assert_eq!(
            claim.value.unwrap().source.unwrap().sd_hash.len(),
            96
        );
    }

    #[test]
    fn missing_support_amount_is_zero() {
        let mut json = claim_json();
        json["signing_channel"]["meta"] = serde_json::json!({});
        let claim: Claim = serde_json::from_value(json).unwrap();
        assert_eq!(claim.support_amount(), 0);
    }
}
