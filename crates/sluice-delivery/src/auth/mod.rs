//! Authentication resolution for outbound requests.
//!
//! Static variants (API key, basic, bearer, custom headers) render
//! directly into headers. Token-fetching variants (OAuth2
//! client-credentials, custom token endpoints) go through a per-
//! integration cache: refreshes are serialized behind a per-integration
//! async mutex so concurrent deliveries never stampede the token
//! endpoint, and at most one token is cached per integration. OAuth1
//! signs each request individually.

pub mod oauth1;

use base64::Engine as _;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sluice_core::event::DeliveryContext;
use sluice_core::integration::AuthConfig;
use sluice_core::template;
use sluice_error::DeliveryError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Tokens are refreshed this long before their reported expiry
pub const EXPIRY_SKEW: Duration = Duration::from_secs(30);
/// Max token-fetch attempts per resolution
pub const MAX_TOKEN_ATTEMPTS: u32 = 3;

/// Headers to attach to the outbound request
#[derive(Debug, Clone, Default)]
pub struct ResolvedAuth {
    /// Header name/value pairs
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    header_name:  String,
    header_value: String,
    expires_at:   Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

#[derive(Default)]
struct TokenSlot {
    token: Option<CachedToken>,
}

/// Resolves authentication for integrations
pub struct AuthResolver {
    http:  reqwest::Client,
    slots: DashMap<Uuid, Arc<Mutex<TokenSlot>>>,
}

impl AuthResolver {
    /// Create a resolver using the shared HTTP client.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            slots: DashMap::new(),
        }
    }

    /// Drop any cached token for an integration (e.g. after its config
    /// changed).
    pub fn invalidate(&self, integration_id: Uuid) {
        self.slots.remove(&integration_id);
    }

    /// Resolve auth headers for one request.
    pub async fn resolve(
        &self,
        integration_id: Uuid,
        auth: &AuthConfig,
        ctx: &DeliveryContext,
        http_method: &str,
        url: &str,
    ) -> Result<ResolvedAuth, DeliveryError> {
        match auth {
            AuthConfig::None => Ok(ResolvedAuth::default()),

            AuthConfig::ApiKey {
                header_name,
                api_key,
            } => Ok(ResolvedAuth {
                headers: vec![(header_name.clone(), api_key.clone())],
            }),

            AuthConfig::Basic { username, password } => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                Ok(ResolvedAuth {
                    headers: vec![("Authorization".to_string(), format!("Basic {credentials}"))],
                })
            },

            AuthConfig::Bearer { token } => Ok(ResolvedAuth {
                headers: vec![("Authorization".to_string(), format!("Bearer {token}"))],
            }),

            AuthConfig::CustomHeaders { headers } => Ok(ResolvedAuth {
                headers: headers
                    .iter()
                    .map(|pair| (pair.key.clone(), template::render_str(&pair.value, ctx)))
                    .collect(),
            }),

            AuthConfig::Oauth1 {
                consumer_key,
                consumer_secret,
                token,
                token_secret,
                realm,
                signature_method,
            } => {
                let nonce: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(16)
                    .map(char::from)
                    .collect();
                let header = oauth1::authorization_header(
                    &oauth1::Oauth1Request {
                        consumer_key,
                        consumer_secret,
                        token: token.as_deref(),
                        token_secret: token_secret.as_deref(),
                        realm: realm.as_deref(),
                        signature_method: *signature_method,
                    },
                    http_method,
                    url,
                    &nonce,
                    chrono::Utc::now().timestamp(),
                )?;
                Ok(ResolvedAuth {
                    headers: vec![("Authorization".to_string(), header)],
                })
            },

            AuthConfig::Oauth2 { .. } | AuthConfig::Custom { .. } => {
                self.resolve_cached_token(integration_id, auth, ctx).await
            },
        }
    }

    /// Serialized token resolution for OAuth2 / custom token endpoints.
    async fn resolve_cached_token(
        &self,
        integration_id: Uuid,
        auth: &AuthConfig,
        ctx: &DeliveryContext,
    ) -> Result<ResolvedAuth, DeliveryError> {
        let slot = self
            .slots
            .entry(integration_id)
            .or_insert_with(|| Arc::new(Mutex::new(TokenSlot::default())))
            .clone();

        // Per-integration mutex: one refresh at a time, everyone else
        // waits and reads the fresh token.
        let mut guard = slot.lock().await;

        if let Some(token) = &guard.token {
            if token.is_fresh() {
                return Ok(ResolvedAuth {
                    headers: vec![(token.header_name.clone(), token.header_value.clone())],
                });
            }
        }

        let mut last_error = DeliveryError::Auth {
            reason:   "token fetch never attempted".to_string(),
            attempts: 0,
        };
        for attempt in 1..=MAX_TOKEN_ATTEMPTS {
            match self.fetch_token(auth, ctx).await {
                Ok(token) => {
                    debug!(integration = %integration_id, attempt, "token refreshed");
                    let resolved = ResolvedAuth {
                        headers: vec![(token.header_name.clone(), token.header_value.clone())],
                    };
                    guard.token = Some(token);
                    return Ok(resolved);
                },
                Err(e) => {
                    last_error = DeliveryError::Auth {
                        reason: e.to_string(),
                        attempts: attempt,
                    };
                },
            }
        }
        guard.token = None;
        Err(last_error)
    }

    async fn fetch_token(
        &self,
        auth: &AuthConfig,
        ctx: &DeliveryContext,
    ) -> Result<CachedToken, DeliveryError> {
        match auth {
            AuthConfig::Oauth2 {
                token_url,
                client_id,
                client_secret,
                scope,
            } => {
                let mut form = vec![
                    ("grant_type", "client_credentials".to_string()),
                    ("client_id", client_id.clone()),
                    ("client_secret", client_secret.clone()),
                ];
                if let Some(scope) = scope {
                    form.push(("scope", scope.clone()));
                }

                // Token endpoints are asked for a fresh token every time
                let response = self
                    .http
                    .post(token_url)
                    .header("Cache-Control", "no-cache")
                    .form(&form)
                    .send()
                    .await
                    .map_err(|e| DeliveryError::Network {
                        reason: format!("token endpoint: {e}"),
                    })?;

                let status = response.status();
                if !status.is_success() {
                    return Err(DeliveryError::Auth {
                        reason:   format!("token endpoint returned {status}"),
                        attempts: 1,
                    });
                }

                let body: serde_json::Value =
                    response.json().await.map_err(|e| DeliveryError::Auth {
                        reason:   format!("token response is not JSON: {e}"),
                        attempts: 1,
                    })?;

                let access_token = body
                    .get("access_token")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| DeliveryError::Auth {
                        reason:   "token response has no access_token".to_string(),
                        attempts: 1,
                    })?;
                let expires_in = body.get("expires_in").and_then(serde_json::Value::as_u64);

                Ok(CachedToken {
                    header_name:  "Authorization".to_string(),
                    header_value: format!("Bearer {access_token}"),
                    expires_at:   expires_in.map(|secs| {
                        Instant::now()
                            + Duration::from_secs(secs).saturating_sub(EXPIRY_SKEW)
                    }),
                })
            },

            AuthConfig::Custom {
                token_endpoint,
                method,
                request_body,
                token_path,
                token_header_name,
                value_prefix,
            } => {
                let body = template::render_value(request_body, ctx);
                let request = match method {
                    sluice_core::integration::HttpMethod::Get => self.http.get(token_endpoint),
                    _ => self.http.post(token_endpoint).json(&body),
                };
                let response = request.send().await.map_err(|e| DeliveryError::Network {
                    reason: format!("token endpoint: {e}"),
                })?;

                let status = response.status();
                if !status.is_success() {
                    return Err(DeliveryError::Auth {
                        reason:   format!("token endpoint returned {status}"),
                        attempts: 1,
                    });
                }

                let json: serde_json::Value =
                    response.json().await.map_err(|e| DeliveryError::Auth {
                        reason:   format!("token response is not JSON: {e}"),
                        attempts: 1,
                    })?;

                let token = sluice_core::transform::get_path(&json, token_path)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| DeliveryError::Auth {
                        reason:   format!("no token at path '{token_path}'"),
                        attempts: 1,
                    })?;

                let value = match value_prefix {
                    Some(prefix) => format!("{prefix}{token}"),
                    None => token.to_string(),
                };

                let expires_in = json.get("expires_in").and_then(serde_json::Value::as_u64);

                Ok(CachedToken {
                    header_name:  token_header_name.clone(),
                    header_value: value,
                    expires_at:   expires_in.map(|secs| {
                        Instant::now()
                            + Duration::from_secs(secs).saturating_sub(EXPIRY_SKEW)
                    }),
                })
            },

            _ => Err(DeliveryError::Config {
                reason: "variant does not use the token cache".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sluice_core::integration::HeaderPair;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> DeliveryContext {
        DeliveryContext {
            org_id:           100,
            org_unit_id:      None,
            event_type:       "ORDER_CREATED".to_string(),
            integration_id:   Uuid::nil(),
            integration_name: "erp-sync".to_string(),
            now:              Utc::now(),
        }
    }

    fn resolver() -> AuthResolver {
        AuthResolver::new(reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_static_variants() {
        let resolver = resolver();
        let id = Uuid::new_v4();

        let auth = AuthConfig::ApiKey {
            header_name: "X-Api-Key".to_string(),
            api_key:     "k1".to_string(),
        };
        let resolved = resolver.resolve(id, &auth, &ctx(), "POST", "https://x.test").await.unwrap();
        assert_eq!(resolved.headers, vec![("X-Api-Key".to_string(), "k1".to_string())]);

        let auth = AuthConfig::Basic {
            username: "u".to_string(),
            password: "p".to_string(),
        };
        let resolved = resolver.resolve(id, &auth, &ctx(), "POST", "https://x.test").await.unwrap();
        assert_eq!(
            resolved.headers[0].1,
            format!("Basic {}", base64::engine::general_purpose::STANDARD.encode("u:p"))
        );

        let auth = AuthConfig::Bearer {
            token: "t0".to_string(),
        };
        let resolved = resolver.resolve(id, &auth, &ctx(), "POST", "https://x.test").await.unwrap();
        assert_eq!(resolved.headers[0].1, "Bearer t0");
    }

    #[tokio::test]
    async fn test_custom_headers_are_templated() {
        let resolver = resolver();
        let auth = AuthConfig::CustomHeaders {
            headers: vec![HeaderPair {
                key:   "X-Org".to_string(),
                value: "org-{{config.orgId}}".to_string(),
            }],
        };
        let resolved = resolver
            .resolve(Uuid::new_v4(), &auth, &ctx(), "POST", "https://x.test")
            .await
            .unwrap();
        assert_eq!(resolved.headers[0], ("X-Org".to_string(), "org-100".to_string()));
    }

    #[tokio::test]
    async fn test_oauth2_token_fetch_and_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header("Cache-Control", "no-cache"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=cid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "expires_in": 3600,
            })))
            .expect(1) // the second resolve must hit the cache
            .mount(&server)
            .await;

        let resolver = resolver();
        let id = Uuid::new_v4();
        let auth = AuthConfig::Oauth2 {
            token_url:     format!("{}/token", server.uri()),
            client_id:     "cid".to_string(),
            client_secret: "cs".to_string(),
            scope:         Some("read".to_string()),
        };

        let first = resolver.resolve(id, &auth, &ctx(), "POST", "https://x.test").await.unwrap();
        assert_eq!(first.headers[0].1, "Bearer tok-1");

        let second = resolver.resolve(id, &auth, &ctx(), "POST", "https://x.test").await.unwrap();
        assert_eq!(second.headers[0].1, "Bearer tok-1");
    }

    #[tokio::test]
    async fn test_oauth2_concurrent_refreshes_are_serialized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(std::time::Duration::from_millis(50))
                    .set_body_json(serde_json::json!({
                        "access_token": "tok-shared",
                        "expires_in": 3600,
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resolver = Arc::new(resolver());
        let id = Uuid::new_v4();
        let auth = AuthConfig::Oauth2 {
            token_url:     format!("{}/token", server.uri()),
            client_id:     "cid".to_string(),
            client_secret: "cs".to_string(),
            scope:         None,
        };

        let mut handles = Vec::new();
        for _ in 0..5 {
            let resolver = resolver.clone();
            let auth = auth.clone();
            handles.push(tokio::spawn(async move {
                resolver.resolve(id, &auth, &ctx(), "POST", "https://x.test").await
            }));
        }
        for handle in handles {
            let resolved = handle.await.unwrap().unwrap();
            assert_eq!(resolved.headers[0].1, "Bearer tok-shared");
        }
    }

    #[tokio::test]
    async fn test_oauth2_failure_is_auth_error_with_capped_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(u64::from(MAX_TOKEN_ATTEMPTS))
            .mount(&server)
            .await;

        let resolver = resolver();
        let auth = AuthConfig::Oauth2 {
            token_url:     format!("{}/token", server.uri()),
            client_id:     "cid".to_string(),
            client_secret: "cs".to_string(),
            scope:         None,
        };

        let err = resolver
            .resolve(Uuid::new_v4(), &auth, &ctx(), "POST", "https://x.test")
            .await
            .unwrap_err();
        match err {
            DeliveryError::Auth { attempts, .. } => assert_eq!(attempts, MAX_TOKEN_ATTEMPTS),
            other => panic!("expected auth error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_custom_token_endpoint_with_dotted_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"session": {"token": "sess-9"}},
            })))
            .mount(&server)
            .await;

        let resolver = resolver();
        let auth = AuthConfig::Custom {
            token_endpoint:    format!("{}/auth", server.uri()),
            method:            sluice_core::integration::HttpMethod::Post,
            request_body:      serde_json::json!({"org": "{{config.orgId}}"}),
            token_path:        "data.session.token".to_string(),
            token_header_name: "X-Session".to_string(),
            value_prefix:      None,
        };

        let resolved = resolver
            .resolve(Uuid::new_v4(), &auth, &ctx(), "POST", "https://x.test")
            .await
            .unwrap();
        assert_eq!(resolved.headers[0], ("X-Session".to_string(), "sess-9".to_string()));
    }
}
