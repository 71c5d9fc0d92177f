//! Integration configuration: tenant-scoped delivery rules.
//!
//! An integration describes how events of one type, for one tenant, are
//! transformed and delivered to one or more HTTP endpoints. The `auth`,
//! `transformation` and `delivery_mode` fields are tagged variants with a
//! discriminator field; everything is validated at load time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_error::ConfigError;
use uuid::Uuid;

/// Bounds on per-request timeout (milliseconds)
pub const TIMEOUT_MS_MIN: u64 = 1_000;
/// Upper bound on per-request timeout (milliseconds)
pub const TIMEOUT_MS_MAX: u64 = 60_000;
/// Upper bound on retry count
pub const RETRY_COUNT_MAX: u32 = 10;

/// Direction of an integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Triggered by ingested events, pushes to an external endpoint
    Outbound,
    /// Proxies client-app requests to an external API
    Inbound,
    /// Periodically pulls from a data source and pushes to an endpoint
    Scheduled,
}

impl Direction {
    /// String form as persisted.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "OUTBOUND",
            Self::Inbound => "INBOUND",
            Self::Scheduled => "SCHEDULED",
        }
    }
}

/// Tenant scope for matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantScope {
    /// Applies only to the exact org unit
    EntityOnly,
    /// Applies to the whole org, minus an exclusion list
    IncludeChildren,
}

/// When deliveries happen relative to the triggering event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMode {
    /// Deliver as soon as the event is processed (default)
    #[default]
    Immediate,
    /// Deliver once at a script-computed future time
    Delayed,
    /// Deliver repeatedly per a script-computed recurrence
    Recurring,
}

/// HTTP method for outbound requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP GET
    Get,
    /// HTTP POST (default)
    #[default]
    Post,
    /// HTTP PUT
    Put,
    /// HTTP PATCH
    Patch,
    /// HTTP DELETE
    Delete,
}

impl HttpMethod {
    /// Method name in wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// A single templated header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPair {
    /// Header name
    pub key:   String,
    /// Header value; may contain `{{...}}` template tokens
    pub value: String,
}

/// OAuth1 signature method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Oauth1Signature {
    /// HMAC-SHA1 (default, widest endpoint support)
    #[default]
    HmacSha1,
    /// HMAC-SHA256
    HmacSha256,
}

/// Authentication configuration (tagged union)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthConfig {
    /// No authentication
    None,

    /// Single API-key header
    ApiKey {
        /// Header to carry the key
        header_name: String,
        /// The key value
        api_key:     String,
    },

    /// HTTP Basic authentication
    Basic {
        /// Username
        username: String,
        /// Password
        password: String,
    },

    /// Static bearer token
    Bearer {
        /// Token value
        token: String,
    },

    /// OAuth 1.0a request signing
    Oauth1 {
        /// Consumer key
        consumer_key:     String,
        /// Consumer secret
        consumer_secret:  String,
        /// Access token, when the endpoint requires one
        token:            Option<String>,
        /// Access token secret
        token_secret:     Option<String>,
        /// Optional realm attribute
        realm:            Option<String>,
        /// Signature method
        #[serde(default)]
        signature_method: Oauth1Signature,
    },

    /// OAuth2 client-credentials grant
    Oauth2 {
        /// Token endpoint URL
        token_url:     String,
        /// Client id
        client_id:     String,
        /// Client secret
        client_secret: String,
        /// Optional scope
        scope:         Option<String>,
    },

    /// Custom token endpoint: fetch a token, extract it by dotted path,
    /// place it in a configurable header
    Custom {
        /// Token endpoint URL
        token_endpoint:    String,
        /// HTTP method for the token request
        #[serde(default)]
        method:            HttpMethod,
        /// JSON body sent to the token endpoint
        #[serde(default)]
        request_body:      serde_json::Value,
        /// Dotted path to the token within the response JSON
        token_path:        String,
        /// Header that carries the extracted token
        #[serde(default = "default_token_header")]
        token_header_name: String,
        /// Optional prefix prepended to the token value (e.g. "Bearer ")
        #[serde(default)]
        value_prefix:      Option<String>,
    },

    /// Fixed list of templated headers
    CustomHeaders {
        /// Headers to attach, with template substitution applied
        headers: Vec<HeaderPair>,
    },
}

fn default_token_header() -> String {
    "Authorization".to_string()
}

impl AuthConfig {
    /// Discriminator name, as persisted.
    #[must_use]
    pub const fn auth_type(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::ApiKey { .. } => "API_KEY",
            Self::Basic { .. } => "BASIC",
            Self::Bearer { .. } => "BEARER",
            Self::Oauth1 { .. } => "OAUTH1",
            Self::Oauth2 { .. } => "OAUTH2",
            Self::Custom { .. } => "CUSTOM",
            Self::CustomHeaders { .. } => "CUSTOM_HEADERS",
        }
    }

    /// Validate required fields for the variant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::None | Self::Oauth1 { .. } => Ok(()),
            Self::ApiKey {
                header_name,
                api_key,
            } => {
                if header_name.is_empty() || api_key.is_empty() {
                    return Err(ConfigError::missing("header_name/api_key", "API_KEY auth"));
                }
                Ok(())
            },
            Self::Basic { username, .. } => {
                if username.is_empty() {
                    return Err(ConfigError::missing("username", "BASIC auth"));
                }
                Ok(())
            },
            Self::Bearer { token } => {
                if token.is_empty() {
                    return Err(ConfigError::missing("token", "BEARER auth"));
                }
                Ok(())
            },
            Self::Oauth2 {
                token_url,
                client_id,
                ..
            } => {
                if token_url.is_empty() {
                    return Err(ConfigError::missing("token_url", "OAUTH2 auth"));
                }
                if client_id.is_empty() {
                    return Err(ConfigError::missing("client_id", "OAUTH2 auth"));
                }
                Ok(())
            },
            Self::Custom {
                token_endpoint,
                token_path,
                ..
            } => {
                if token_endpoint.is_empty() {
                    return Err(ConfigError::missing("token_endpoint", "CUSTOM auth"));
                }
                if token_path.is_empty() {
                    return Err(ConfigError::missing("token_path", "CUSTOM auth"));
                }
                Ok(())
            },
            Self::CustomHeaders { headers } => {
                if headers.is_empty() {
                    return Err(ConfigError::missing("headers", "CUSTOM_HEADERS auth"));
                }
                Ok(())
            },
        }
    }
}

/// Per-field transform applied by SIMPLE mappings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTransform {
    /// Copy the value unchanged (default)
    #[default]
    None,
    /// Trim surrounding whitespace (strings only)
    Trim,
    /// Uppercase (strings only)
    Upper,
    /// Lowercase (strings only)
    Lower,
    /// Normalize to RFC 3339 date-time
    Date,
    /// Use `default_value` when the source field is missing
    Default,
}

/// One SIMPLE-mode field mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dotted path into the event payload
    pub source_field:  String,
    /// Dotted path into the outbound body
    pub target_field:  String,
    /// Transform to apply
    #[serde(default)]
    pub transform:     FieldTransform,
    /// Value emitted when the source is missing and `transform = default`
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
}

/// A static field injected into the outbound body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticField {
    /// Dotted path into the outbound body
    pub key:   String,
    /// Literal value; strings may contain template tokens
    pub value: serde_json::Value,
}

/// Transformation configuration (tagged union)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformationConfig {
    /// Declarative field mappings
    Simple {
        /// Ordered field mappings
        #[serde(default)]
        mappings:      Vec<FieldMapping>,
        /// Static fields merged into the result
        #[serde(default)]
        static_fields: Vec<StaticField>,
    },
    /// Sandboxed script producing the outbound body
    Script {
        /// Script source
        source: String,
    },
}

impl TransformationConfig {
    /// Validate the variant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Simple { mappings, .. } => {
                for m in mappings {
                    if m.source_field.is_empty() || m.target_field.is_empty() {
                        return Err(ConfigError::Invalid {
                            message: "mapping requires source_field and target_field".to_string(),
                        });
                    }
                    if m.transform == FieldTransform::Default && m.default_value.is_none() {
                        return Err(ConfigError::missing(
                            "default_value",
                            "mapping with transform=default",
                        ));
                    }
                }
                Ok(())
            },
            Self::Script { source } => {
                if source.trim().is_empty() {
                    return Err(ConfigError::missing("source", "SCRIPT transformation"));
                }
                Ok(())
            },
        }
    }
}

/// What a failing action does to subsequent actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnError {
    /// Later actions still run (default)
    #[default]
    Continue,
    /// Later actions are skipped
    Stop,
}

/// Outbound request signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Header carrying the signature list
    #[serde(default = "default_signature_header")]
    pub header_name: String,
    /// Active secrets, newest first; each produces a `vN=` entry
    pub secrets:     Vec<String>,
}

fn default_signature_header() -> String {
    "X-Signature".to_string()
}

/// One HTTP request within a multi-action integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Action name, recorded on trace steps
    pub name:           String,
    /// Endpoint URL; may contain template tokens
    pub target_url:     String,
    /// HTTP method
    #[serde(default)]
    pub http_method:    HttpMethod,
    /// Extra headers for this action
    #[serde(default)]
    pub headers:        Vec<HeaderPair>,
    /// Boolean sandbox expression gating this action
    #[serde(default)]
    pub condition:      Option<String>,
    /// Per-action transformation; falls back to the integration's
    #[serde(default)]
    pub transformation: Option<TransformationConfig>,
    /// Failure policy toward subsequent actions
    #[serde(default)]
    pub on_error:       OnError,
    /// Per-action signing; falls back to the integration's
    #[serde(default)]
    pub signing:        Option<SigningConfig>,
}

/// A per-tenant integration rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Integration id
    pub id:                    Uuid,
    /// Parent tenant
    pub org_id:                i64,
    /// Leaf tenant, when scoped to one
    pub org_unit_id:           Option<i64>,
    /// Display name
    pub name:                  String,
    /// Direction
    pub direction:             Direction,
    /// Event type to match, or `"*"` for all
    pub event_type:            String,
    /// Tenant scope
    pub scope:                 TenantScope,
    /// Org units excluded under `INCLUDE_CHILDREN`
    #[serde(default)]
    pub excluded_org_unit_ids: Vec<i64>,
    /// Endpoint URL for single-action integrations
    #[serde(default)]
    pub target_url:            Option<String>,
    /// HTTP method for single-action integrations
    #[serde(default)]
    pub http_method:           HttpMethod,
    /// Headers for single-action integrations
    #[serde(default)]
    pub headers:               Vec<HeaderPair>,
    /// Authentication
    pub auth:                  AuthConfig,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms:            u64,
    /// Max retry attempts per delivery
    #[serde(default = "default_retry_count")]
    pub retry_count:           u32,
    /// Transformation applied to the event payload
    pub transformation:        TransformationConfig,
    /// Ordered actions for multi-action integrations; empty means the
    /// integration's own `target_url`/`http_method` form a single action
    #[serde(default)]
    pub actions:               Vec<ActionSpec>,
    /// When deliveries happen
    #[serde(default)]
    pub delivery_mode:         DeliveryMode,
    /// Scheduling script for DELAYED / RECURRING modes
    #[serde(default)]
    pub scheduling_script:     Option<String>,
    /// Outbound signing
    #[serde(default)]
    pub signing:               Option<SigningConfig>,
    /// Whether the integration participates in matching
    pub is_active:             bool,
    /// Last modification time; used for deterministic tie-breaking
    pub updated_at:            DateTime<Utc>,
}

const fn default_timeout_ms() -> u64 {
    10_000
}

const fn default_retry_count() -> u32 {
    3
}

impl IntegrationConfig {
    /// Validate the whole configuration at load time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::missing("name", "integration"));
        }
        if self.event_type.is_empty() {
            return Err(ConfigError::missing("event_type", "integration"));
        }
        if !(TIMEOUT_MS_MIN..=TIMEOUT_MS_MAX).contains(&self.timeout_ms) {
            return Err(ConfigError::OutOfBounds {
                field: "timeout_ms".to_string(),
                value: self.timeout_ms as i64,
                min:   TIMEOUT_MS_MIN as i64,
                max:   TIMEOUT_MS_MAX as i64,
            });
        }
        if self.retry_count > RETRY_COUNT_MAX {
            return Err(ConfigError::OutOfBounds {
                field: "retry_count".to_string(),
                value: i64::from(self.retry_count),
                min:   0,
                max:   i64::from(RETRY_COUNT_MAX),
            });
        }
        if self.actions.is_empty() && self.target_url.is_none() {
            return Err(ConfigError::missing("target_url", "single-action integration"));
        }
        for action in &self.actions {
            if action.target_url.is_empty() {
                return Err(ConfigError::missing("target_url", "action"));
            }
            if let Some(t) = &action.transformation {
                t.validate()?;
            }
        }
        if matches!(
            self.delivery_mode,
            DeliveryMode::Delayed | DeliveryMode::Recurring
        ) && self.scheduling_script.as_deref().unwrap_or("").trim().is_empty()
        {
            return Err(ConfigError::missing(
                "scheduling_script",
                "DELAYED/RECURRING integration",
            ));
        }
        if let Some(signing) = &self.signing {
            if signing.secrets.is_empty() {
                return Err(ConfigError::missing("signing.secrets", "integration"));
            }
        }
        self.auth.validate()?;
        self.transformation.validate()
    }

    /// The effective ordered action list: the declared actions, or a single
    /// implicit action built from the integration's own endpoint fields.
    #[must_use]
    pub fn effective_actions(&self) -> Vec<ActionSpec> {
        if !self.actions.is_empty() {
            return self.actions.clone();
        }
        vec![ActionSpec {
            name:           self.name.clone(),
            target_url:     self.target_url.clone().unwrap_or_default(),
            http_method:    self.http_method,
            headers:        self.headers.clone(),
            condition:      None,
            transformation: None,
            on_error:       OnError::Continue,
            signing:        None,
        }]
    }

    /// Whether this integration matches any event type.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.event_type == "*"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn minimal(event_type: &str) -> IntegrationConfig {
        IntegrationConfig {
            id:                    Uuid::new_v4(),
            org_id:                100,
            org_unit_id:           Some(7),
            name:                  "erp-sync".to_string(),
            direction:             Direction::Outbound,
            event_type:            event_type.to_string(),
            scope:                 TenantScope::EntityOnly,
            excluded_org_unit_ids: Vec::new(),
            target_url:            Some("https://api.example.com/orders".to_string()),
            http_method:           HttpMethod::Post,
            headers:               Vec::new(),
            auth:                  AuthConfig::None,
            timeout_ms:            10_000,
            retry_count:           3,
            transformation:        TransformationConfig::Simple {
                mappings:      Vec::new(),
                static_fields: Vec::new(),
            },
            actions:               Vec::new(),
            delivery_mode:         DeliveryMode::Immediate,
            scheduling_script:     None,
            signing:               None,
            is_active:             true,
            updated_at:            Utc::now(),
        }
    }

    #[test]
    fn test_minimal_config_validates() {
        assert!(minimal("ORDER_CREATED").validate().is_ok());
    }

    #[test]
    fn test_timeout_bounds_enforced() {
        let mut config = minimal("ORDER_CREATED");
        config.timeout_ms = 500;
        assert!(config.validate().is_err());
        config.timeout_ms = 61_000;
        assert!(config.validate().is_err());
        config.timeout_ms = 60_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oauth2_requires_token_url() {
        let mut config = minimal("ORDER_CREATED");
        config.auth = AuthConfig::Oauth2 {
            token_url:     String::new(),
            client_id:     "c".to_string(),
            client_secret: "s".to_string(),
            scope:         None,
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("token_url"));
    }

    #[test]
    fn test_scheduled_mode_requires_script() {
        let mut config = minimal("APPOINTMENT_CREATED");
        config.delivery_mode = DeliveryMode::Delayed;
        assert!(config.validate().is_err());
        config.scheduling_script = Some("event.payload.startTime".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mapping_default_requires_value() {
        let mut config = minimal("ORDER_CREATED");
        config.transformation = TransformationConfig::Simple {
            mappings:      vec![FieldMapping {
                source_field:  "status".to_string(),
                target_field:  "state".to_string(),
                transform:     FieldTransform::Default,
                default_value: None,
            }],
            static_fields: Vec::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auth_tagged_serde() {
        let auth = AuthConfig::ApiKey {
            header_name: "X-Api-Key".to_string(),
            api_key:     "k".to_string(),
        };
        let json = serde_json::to_value(&auth).unwrap();
        assert_eq!(json["type"], "API_KEY");
        let back: AuthConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.auth_type(), "API_KEY");
    }

    #[test]
    fn test_transformation_tagged_serde() {
        let value = json!({"mode": "SCRIPT", "source": "payload"});
        let t: TransformationConfig = serde_json::from_value(value).unwrap();
        assert!(matches!(t, TransformationConfig::Script { .. }));
    }

    #[test]
    fn test_effective_actions_implicit_single() {
        let config = minimal("ORDER_CREATED");
        let actions = config.effective_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].target_url, "https://api.example.com/orders");
        assert_eq!(actions[0].on_error, OnError::Continue);
    }

    #[test]
    fn test_wildcard() {
        assert!(minimal("*").is_wildcard());
        assert!(!minimal("ORDER_CREATED").is_wildcard());
    }
}
