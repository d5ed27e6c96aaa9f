use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::translator;
use crate::{ExtProcError, Result};

pub const DEFAULT_MODEL_NAME_HEADER_KEY: &str = "x-ai-eg-model";
pub const DEFAULT_SELECTED_BACKEND_HEADER_KEY: &str = "x-ai-eg-selected-backend";
pub const DEFAULT_METADATA_NAMESPACE: &str = "io.envoy.ai_gateway";
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiSchemaName {
    #[serde(rename = "OpenAI")]
    OpenAi,
    #[serde(rename = "AWSBedrock")]
    AwsBedrock,
    #[serde(rename = "AzureOpenAI")]
    AzureOpenAi,
    #[serde(rename = "GCPVertexAI")]
    GcpVertexAi,
    #[serde(rename = "GCPAnthropic")]
    GcpAnthropic,
}

impl ApiSchemaName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::AwsBedrock => "AWSBedrock",
            Self::AzureOpenAi => "AzureOpenAI",
            Self::GcpVertexAi => "GCPVertexAI",
            Self::GcpAnthropic => "GCPAnthropic",
        }
    }

    /// Vertex AI hosted schemas address models relative to a project and
    /// location, so they need `gcp_credentials` auth.
    pub fn is_gcp(self) -> bool {
        matches!(self, Self::GcpVertexAi | Self::GcpAnthropic)
    }
}

impl std::fmt::Display for ApiSchemaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedApiSchema {
    pub name: ApiSchemaName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl VersionedApiSchema {
    pub fn new(name: ApiSchemaName) -> Self {
        Self {
            name,
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn version(&self) -> Option<&str> {
        self.version
            .as_deref()
            .map(str::trim)
            .filter(|version| !version.is_empty())
    }
}

/// Interceptor configuration. Loaded as a whole and never mutated in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub schema: VersionedApiSchema,
    #[serde(default = "default_model_name_header_key")]
    pub model_name_header_key: String,
    #[serde(default = "default_selected_backend_header_key")]
    pub selected_backend_header_key: String,
    #[serde(default = "default_metadata_namespace")]
    pub metadata_namespace: String,
    /// Largest request body buffered for translation; bigger bodies get 413.
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
    #[serde(default)]
    pub request_costs: Vec<RequestCost>,
    #[serde(default)]
    pub rules: Vec<RouteRule>,
}

fn default_model_name_header_key() -> String {
    DEFAULT_MODEL_NAME_HEADER_KEY.to_string()
}

fn default_selected_backend_header_key() -> String {
    DEFAULT_SELECTED_BACKEND_HEADER_KEY.to_string()
}

fn default_metadata_namespace() -> String {
    DEFAULT_METADATA_NAMESPACE.to_string()
}

fn default_max_request_body_bytes() -> usize {
    DEFAULT_MAX_REQUEST_BODY_BYTES
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCost {
    pub metadata_key: String,
    #[serde(rename = "type")]
    pub kind: RequestCostKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestCostKind {
    InputToken,
    OutputToken,
    TotalToken,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default)]
    pub headers: Vec<HeaderMatch>,
    #[serde(default)]
    pub backends: Vec<RuleBackend>,
}

/// Matches one request header either exactly or by regex.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMatch {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl HeaderMatch {
    pub fn exact(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            regex: None,
        }
    }

    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            regex: Some(pattern.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleBackend {
    pub name: String,
    pub schema: VersionedApiSchema,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<BackendAuth>,
    /// Rate-limit rule references, echoed in dynamic metadata.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rate_limits: Vec<String>,
}

fn default_weight() -> u32 {
    1
}

impl RuleBackend {
    pub fn new(name: impl Into<String>, schema: VersionedApiSchema) -> Self {
        Self {
            name: name.into(),
            schema,
            weight: default_weight(),
            model_name_override: None,
            auth: None,
            rate_limits: Vec::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendAuth {
    ApiKey(ApiKeyAuth),
    AzureAccessToken(AzureAccessTokenAuth),
    AwsCredentials(AwsCredentialsAuth),
    AwsOidcExchange(AwsOidcExchangeAuth),
    GcpCredentials(GcpCredentialsAuth),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyAuth {
    pub filename: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureAccessTokenAuth {
    pub filename: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsCredentialsAuth {
    pub region: String,
    pub credential_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsOidcExchangeAuth {
    pub region: String,
    pub role_arn: String,
    pub oidc: OidcConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sts_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval_secs: Option<u64>,
}

/// Pre-minted GCP access token and the project/location it is scoped to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpCredentialsAuth {
    pub access_token_file: PathBuf,
    pub region: String,
    pub project_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret_file: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl Config {
    /// Empty config with default header keys and namespace.
    pub fn new(schema: VersionedApiSchema) -> Self {
        Self {
            schema,
            model_name_header_key: default_model_name_header_key(),
            selected_backend_header_key: default_selected_backend_header_key(),
            metadata_namespace: default_metadata_namespace(),
            max_request_body_bytes: default_max_request_body_bytes(),
            request_costs: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Loads and validates a config file. The format follows the extension:
    /// `.yaml`/`.yml`, `.toml`, anything else is JSON.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let config = match extension.as_deref() {
            #[cfg(feature = "config-yaml")]
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw)?,
            #[cfg(not(feature = "config-yaml"))]
            Some("yaml") | Some("yml") => {
                return Err(ExtProcError::Config(
                    "yaml config requires the config-yaml feature".to_string(),
                ));
            }
            Some("toml") => Self::from_toml_str(&raw)?,
            _ => Self::from_json_str(&raw)?,
        };
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "config-yaml")]
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema.name != ApiSchemaName::OpenAi {
            return Err(ExtProcError::Config(format!(
                "unsupported input schema: {}",
                self.schema.name
            )));
        }
        require_non_empty("model_name_header_key", &self.model_name_header_key)?;
        require_non_empty(
            "selected_backend_header_key",
            &self.selected_backend_header_key,
        )?;
        if self.max_request_body_bytes == 0 {
            return Err(ExtProcError::Config(
                "max_request_body_bytes must be positive".to_string(),
            ));
        }
        for cost in &self.request_costs {
            require_non_empty("request_costs.metadata_key", &cost.metadata_key)?;
        }
        if !self.request_costs.is_empty() {
            require_non_empty("metadata_namespace", &self.metadata_namespace)?;
        }

        for (rule_idx, rule) in self.rules.iter().enumerate() {
            if rule.backends.is_empty() {
                return Err(ExtProcError::Config(format!(
                    "rules[{rule_idx}] has no backends"
                )));
            }
            for matcher in &rule.headers {
                validate_header_match(rule_idx, matcher)?;
            }
            for backend in &rule.backends {
                validate_backend(&self.schema, backend)?;
            }
        }
        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ExtProcError::Config(format!("{field} must be non-empty")));
    }
    Ok(())
}

fn validate_header_match(rule_idx: usize, matcher: &HeaderMatch) -> Result<()> {
    if matcher.name.trim().is_empty() {
        return Err(ExtProcError::Config(format!(
            "rules[{rule_idx}] has a header match without a name"
        )));
    }
    match (&matcher.value, &matcher.regex) {
        (Some(_), None) => Ok(()),
        (None, Some(pattern)) => regex::Regex::new(pattern).map(|_| ()).map_err(|err| {
            ExtProcError::Config(format!(
                "rules[{rule_idx}] header {:?} has an invalid regex: {err}",
                matcher.name
            ))
        }),
        _ => Err(ExtProcError::Config(format!(
            "rules[{rule_idx}] header {:?} must set exactly one of value or regex",
            matcher.name
        ))),
    }
}

fn validate_backend(input: &VersionedApiSchema, backend: &RuleBackend) -> Result<()> {
    require_non_empty("backend name", &backend.name)?;
    if !translator::is_supported(input.name, backend.schema.name) {
        return Err(ExtProcError::Config(format!(
            "backend {:?}: unsupported schema pair {} -> {}",
            backend.name, input.name, backend.schema.name
        )));
    }
    if backend.schema.name == ApiSchemaName::AzureOpenAi && backend.schema.version().is_none() {
        return Err(ExtProcError::Config(format!(
            "backend {:?}: AzureOpenAI schema requires a version",
            backend.name
        )));
    }
    if let Some(model) = &backend.model_name_override {
        require_non_empty("model_name_override", model)?;
    }
    let has_gcp_auth = matches!(backend.auth, Some(BackendAuth::GcpCredentials(_)));
    if backend.schema.name.is_gcp() != has_gcp_auth {
        return Err(ExtProcError::Config(format!(
            "backend {:?}: gcp_credentials auth is required by and only valid for GCPVertexAI and GCPAnthropic schemas",
            backend.name
        )));
    }
    let Some(auth) = &backend.auth else {
        return Ok(());
    };
    match auth {
        BackendAuth::ApiKey(auth) => require_path("api_key.filename", &auth.filename),
        BackendAuth::AzureAccessToken(auth) => {
            require_path("azure_access_token.filename", &auth.filename)
        }
        BackendAuth::AwsCredentials(auth) => {
            require_non_empty("aws_credentials.region", &auth.region)?;
            require_path("aws_credentials.credential_file", &auth.credential_file)
        }
        BackendAuth::AwsOidcExchange(auth) => {
            require_non_empty("aws_oidc_exchange.region", &auth.region)?;
            require_non_empty("aws_oidc_exchange.role_arn", &auth.role_arn)?;
            require_non_empty("aws_oidc_exchange.oidc.token_url", &auth.oidc.token_url)?;
            require_non_empty("aws_oidc_exchange.oidc.client_id", &auth.oidc.client_id)?;
            require_path(
                "aws_oidc_exchange.oidc.client_secret_file",
                &auth.oidc.client_secret_file,
            )?;
            if auth.refresh_interval_secs == Some(0) {
                return Err(ExtProcError::Config(
                    "aws_oidc_exchange.refresh_interval_secs must be positive".to_string(),
                ));
            }
            Ok(())
        }
        BackendAuth::GcpCredentials(auth) => {
            require_path("gcp_credentials.access_token_file", &auth.access_token_file)?;
            require_non_empty("gcp_credentials.region", &auth.region)?;
            require_non_empty("gcp_credentials.project_name", &auth.project_name)
        }
    }
}

fn require_path(field: &str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(ExtProcError::Config(format!("{field} must be non-empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_json(backend_schema: &str) -> String {
        format!(
            r#"{{
                "schema": {{"name": "OpenAI"}},
                "rules": [{{
                    "headers": [{{"name": "x-ai-eg-model", "value": "gpt-4o"}}],
                    "backends": [{{"name": "b", "schema": {backend_schema}}}]
                }}]
            }}"#
        )
    }

    #[test]
    fn json_config_applies_defaults() {
        let config = Config::from_json_str(&base_json(r#"{"name": "OpenAI"}"#)).expect("config");
        assert_eq!(config.model_name_header_key, DEFAULT_MODEL_NAME_HEADER_KEY);
        assert_eq!(
            config.selected_backend_header_key,
            DEFAULT_SELECTED_BACKEND_HEADER_KEY
        );
        assert_eq!(config.max_request_body_bytes, DEFAULT_MAX_REQUEST_BODY_BYTES);
        assert_eq!(config.rules[0].backends[0].weight, 1);
        assert!(config.rules[0].backends[0].auth.is_none());
    }

    #[test]
    fn azure_backend_requires_version() {
        let err = Config::from_json_str(&base_json(r#"{"name": "AzureOpenAI"}"#))
            .expect_err("missing version");
        assert!(err.to_string().contains("requires a version"), "{err}");

        Config::from_json_str(&base_json(
            r#"{"name": "AzureOpenAI", "version": "2024-10-21"}"#,
        ))
        .expect("versioned azure");
    }

    #[test]
    fn non_openai_input_schema_is_rejected() {
        let raw = r#"{"schema": {"name": "AWSBedrock"}, "rules": []}"#;
        let err = Config::from_json_str(raw).expect_err("unsupported input");
        assert!(matches!(err, ExtProcError::Config(_)));
    }

    #[test]
    fn header_match_needs_exactly_one_predicate() {
        let raw = r#"{
            "schema": {"name": "OpenAI"},
            "rules": [{
                "headers": [{"name": "x", "value": "a", "regex": "a"}],
                "backends": [{"name": "b", "schema": {"name": "OpenAI"}}]
            }]
        }"#;
        assert!(Config::from_json_str(raw).is_err());

        let raw = raw.replace(r#""value": "a", "#, "").replace(r#""a"}]"#, r#""(unclosed"}]"#);
        let err = Config::from_json_str(&raw).expect_err("bad regex");
        assert!(err.to_string().contains("invalid regex"), "{err}");
    }

    #[test]
    fn rule_without_backends_is_rejected() {
        let raw = r#"{"schema": {"name": "OpenAI"}, "rules": [{"headers": []}]}"#;
        assert!(Config::from_json_str(raw).is_err());
    }

    #[test]
    fn negative_weight_fails_to_parse() {
        let raw = r#"{
            "schema": {"name": "OpenAI"},
            "rules": [{"backends": [{"name": "b", "schema": {"name": "OpenAI"}, "weight": -1}]}]
        }"#;
        assert!(Config::from_json_str(raw).is_err());
    }

    #[test]
    fn toml_config_parses_auth_union() {
        let raw = r#"
            model_name_header_key = "x-model"

            [schema]
            name = "OpenAI"

            [[rules]]
            headers = [{ name = "x-model", regex = "^anthropic\\." }]

            [[rules.backends]]
            name = "bedrock"
            schema = { name = "AWSBedrock" }

            [rules.backends.auth.aws_credentials]
            region = "us-east-1"
            credential_file = "/etc/aws/credentials"
        "#;
        let config = Config::from_toml_str(raw).expect("toml");
        assert_eq!(config.model_name_header_key, "x-model");
        let Some(BackendAuth::AwsCredentials(auth)) = &config.rules[0].backends[0].auth else {
            panic!("expected aws credentials auth");
        };
        assert_eq!(auth.region, "us-east-1");
        assert!(auth.profile.is_none());
    }

    #[test]
    fn gcp_schemas_require_gcp_credentials() {
        let err = Config::from_json_str(&base_json(r#"{"name": "GCPVertexAI"}"#))
            .expect_err("missing gcp auth");
        assert!(err.to_string().contains("gcp_credentials"), "{err}");

        let raw = r#"{
            "schema": {"name": "OpenAI"},
            "rules": [{"backends": [{
                "name": "claude-vertex",
                "schema": {"name": "GCPAnthropic"},
                "auth": {"gcp_credentials": {
                    "access_token_file": "/etc/gcp/token",
                    "region": "us-east5",
                    "project_name": "acme"
                }}
            }]}]
        }"#;
        let config = Config::from_json_str(raw).expect("gcp anthropic");
        let Some(BackendAuth::GcpCredentials(auth)) = &config.rules[0].backends[0].auth else {
            panic!("expected gcp credentials auth");
        };
        assert_eq!(auth.region, "us-east5");

        let misplaced = raw.replace("GCPAnthropic", "OpenAI");
        assert!(Config::from_json_str(&misplaced).is_err());
        let blank = raw.replace(r#""acme""#, r#"" ""#);
        assert!(Config::from_json_str(&blank).is_err());
    }

    #[tokio::test]
    async fn from_path_picks_format_by_extension() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[schema]\nname = \"OpenAI\"\n").await?;
        let config = Config::from_path(&path).await?;
        assert!(config.rules.is_empty());

        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "[schema]").await?;
        assert!(matches!(
            Config::from_path(&path).await,
            Err(ExtProcError::Json(_))
        ));
        assert!(matches!(
            Config::from_path(dir.path().join("missing.json")).await,
            Err(ExtProcError::Io(_))
        ));
        Ok(())
    }

    #[cfg(feature = "config-yaml")]
    #[test]
    fn yaml_config_with_costs_and_oidc_exchange() {
        let raw = r#"
schema:
  name: OpenAI
request_costs:
  - metadata_key: llm_output_token
    type: output_token
rules:
  - headers:
      - name: x-ai-eg-model
        value: anthropic.claude-3-sonnet
    backends:
      - name: bedrock
        weight: 3
        schema:
          name: AWSBedrock
        auth:
          aws_oidc_exchange:
            region: us-west-2
            role_arn: arn:aws:iam::123456789012:role/gateway
            oidc:
              token_url: https://idp.example.com/oauth/token
              client_id: gateway
              client_secret_file: /etc/oidc/secret
              audience: sts.amazonaws.com
"#;
        let config = Config::from_yaml_str(raw).expect("yaml");
        assert_eq!(config.request_costs[0].kind, RequestCostKind::OutputToken);
        let backend = &config.rules[0].backends[0];
        assert_eq!(backend.weight, 3);
        let Some(BackendAuth::AwsOidcExchange(auth)) = &backend.auth else {
            panic!("expected oidc exchange auth");
        };
        assert_eq!(auth.oidc.audience.as_deref(), Some("sts.amazonaws.com"));
    }
}
