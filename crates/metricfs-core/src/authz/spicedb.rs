//! SpiceDB-backed authorizer.
//!
//! Each permission check is answered from a per-process cache keyed by the
//! full [`CandidateKey`]. Cache misses POST a permission-check request to
//! `<endpoint>/v1/permissions/check` with a bearer token. Transport or HTTP
//! failure is treated as deny (fail-closed) and never cached, so a
//! transient outage cannot poison later requests.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Authorizer, AuthzError, CandidateKey};

const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for [`SpiceDbAuthorizer`].
#[derive(Debug, Clone)]
pub struct SpiceDbConfig {
    /// Endpoint host or URL; a missing scheme defaults to `http://`.
    pub endpoint: String,
    /// Bearer token presented on every check.
    pub token: String,
    /// Subject performing the reads, `type:id` or `type:id#relation`.
    pub subject: String,
    /// Consistency mode; empty defaults to `minimize_latency`.
    pub consistency: String,
}

#[derive(Debug, Clone, Serialize)]
struct ObjectRef {
    #[serde(rename = "objectType")]
    object_type: String,
    #[serde(rename = "objectId")]
    object_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct SubjectRef {
    object: ObjectRef,
    #[serde(rename = "optionalRelation", skip_serializing_if = "Option::is_none")]
    optional_relation: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckPermissionRequest<'a> {
    consistency: &'a serde_json::Value,
    resource: ObjectRef,
    permission: &'a str,
    subject: &'a SubjectRef,
}

#[derive(Debug, Deserialize)]
struct CheckPermissionResponse {
    #[serde(default)]
    permissionship: String,
}

/// Remote authorizer that checks permissions against a SpiceDB endpoint.
pub struct SpiceDbAuthorizer {
    client: reqwest::blocking::Client,
    check_url: String,
    token: String,
    subject: SubjectRef,
    consistency: serde_json::Value,
    cache: RwLock<HashMap<CandidateKey, bool>>,
}

impl SpiceDbAuthorizer {
    /// Builds a remote authorizer from configuration.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthzError`] when the endpoint, token, subject, or
    /// consistency mode is missing or malformed, or when the HTTP client
    /// cannot be constructed.
    pub fn new(config: SpiceDbConfig) -> Result<Self, AuthzError> {
        let endpoint = normalize_endpoint(&config.endpoint)?;
        if config.token.trim().is_empty() {
            return Err(AuthzError::MissingToken);
        }
        let subject = parse_subject(&config.subject)?;
        let consistency = parse_consistency(&config.consistency)?;

        let client = reqwest::blocking::Client::builder()
            .timeout(CHECK_TIMEOUT)
            .build()
            .map_err(AuthzError::Client)?;

        Ok(Self {
            client,
            check_url: format!("{}/v1/permissions/check", endpoint.trim_end_matches('/')),
            token: config.token,
            subject,
            consistency,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn check_remote(&self, candidate: &CandidateKey) -> Result<bool, reqwest::Error> {
        let body = CheckPermissionRequest {
            consistency: &self.consistency,
            resource: ObjectRef {
                object_type: candidate.object_type.clone(),
                object_id: candidate.object_id.clone(),
            },
            permission: &candidate.permission,
            subject: &self.subject,
        };
        let response = self
            .client
            .post(&self.check_url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()?
            .error_for_status()?;
        let parsed: CheckPermissionResponse = response.json()?;
        Ok(parsed.permissionship == "PERMISSIONSHIP_HAS_PERMISSION")
    }
}

impl Authorizer for SpiceDbAuthorizer {
    fn is_allowed(&self, candidate: &CandidateKey) -> bool {
        let candidate = candidate.clone().normalized();
        if candidate.object_type.is_empty() || candidate.object_id.is_empty() {
            return false;
        }

        if let Ok(cache) = self.cache.read() {
            if let Some(&allowed) = cache.get(&candidate) {
                return allowed;
            }
        }

        match self.check_remote(&candidate) {
            Ok(allowed) => {
                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(candidate, allowed);
                }
                allowed
            }
            // Fail closed without caching: a transient transport error must
            // not become a persistent negative entry.
            Err(err) => {
                debug!(error = %err, "spicedb check failed, denying");
                false
            }
        }
    }
}

fn normalize_endpoint(raw: &str) -> Result<String, AuthzError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AuthzError::InvalidEndpoint {
            endpoint: raw.to_string(),
            reason: "endpoint is required".to_string(),
        });
    }
    let endpoint = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let parsed = reqwest::Url::parse(&endpoint).map_err(|err| AuthzError::InvalidEndpoint {
        endpoint: raw.to_string(),
        reason: err.to_string(),
    })?;
    if parsed.host_str().is_none() {
        return Err(AuthzError::InvalidEndpoint {
            endpoint: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(endpoint)
}

fn parse_subject(raw: &str) -> Result<SubjectRef, AuthzError> {
    let mut subject = raw.trim();
    if subject.is_empty() {
        return Err(AuthzError::InvalidSubject {
            value: raw.to_string(),
        });
    }
    let mut relation = None;
    if let Some(hash) = subject.find('#') {
        let rel = subject[hash + 1..].trim();
        if rel.is_empty() {
            return Err(AuthzError::InvalidSubject {
                value: raw.to_string(),
            });
        }
        relation = Some(rel.to_string());
        subject = subject[..hash].trim_end();
    }
    let Some((object_type, object_id)) = subject.split_once(':') else {
        return Err(AuthzError::InvalidSubject {
            value: raw.to_string(),
        });
    };
    let object_type = object_type.trim();
    let object_id = object_id.trim();
    if object_type.is_empty() || object_id.is_empty() {
        return Err(AuthzError::InvalidSubject {
            value: raw.to_string(),
        });
    }
    Ok(SubjectRef {
        object: ObjectRef {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
        },
        optional_relation: relation,
    })
}

fn parse_consistency(raw: &str) -> Result<serde_json::Value, AuthzError> {
    let mode = raw.trim().to_lowercase();
    match mode.as_str() {
        "" | "minimize_latency" => Ok(serde_json::json!({ "minimizeLatency": true })),
        "fully_consistent" => Ok(serde_json::json!({ "fullyConsistent": true })),
        _ => Err(AuthzError::InvalidConsistency {
            value: raw.to_string(),
        }),
    }
}
