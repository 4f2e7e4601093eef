//! S3 and S3-compatible backend
//!
//! Recognized parameters:
//!
//! | key | meaning |
//! |---|---|
//! | `bucket` | bucket name (mandatory) |
//! | `endpoint` | `http(s)://host:port` of an S3-compatible server |
//! | `region` | region, `us-east-1` when unset |
//! | `insecure` | allow plain HTTP |
//! | `s3ForcePathStyle` | path-style addressing |
//! | `accessKey` / `secretKey` | credential keys holding the access key pair |
//!
//! Without a complete key pair in the credentials the ambient AWS
//! environment (variables, web identity, instance metadata) is used.

use std::collections::BTreeMap;
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;

use stowage_common::Error;

use crate::provider::{ObjectStoreProvider, ProviderKind};

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_ACCESS_KEY: &str = "AWS_ACCESS_KEY_ID";
const DEFAULT_SECRET_KEY: &str = "AWS_SECRET_ACCESS_KEY";

/// Parsed S3 parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S3Config {
    /// Bucket name
    pub bucket: String,
    /// Custom endpoint
    pub endpoint: Option<String>,
    /// Region
    pub region: String,
    /// Allow plain HTTP
    pub insecure: bool,
    /// Path-style addressing
    pub force_path_style: bool,
    /// Static access key pair
    pub static_keys: Option<(String, String)>,
}

impl S3Config {
    /// Parse storage parameters and pick the access key pair out of the credentials
    pub fn parse(
        storage: &str,
        parameters: &BTreeMap<String, String>,
        credentials: &BTreeMap<String, String>,
    ) -> Result<Self, Error> {
        let invalid = |msg: String| Error::provider_permanent(storage, "s3", msg);

        let bucket = parameters
            .get("bucket")
            .cloned()
            .ok_or_else(|| invalid("mandatory bucket parameter is not defined".to_string()))?;

        let endpoint = match parameters.get("endpoint") {
            Some(e) if is_valid_endpoint(e) => Some(e.clone()),
            Some(e) => {
                return Err(invalid(format!(
                    "endpoint {:?} must look like http(s)://host:port",
                    e
                )))
            }
            None => None,
        };

        let flag = |key: &str| -> Result<bool, Error> {
            match parameters.get(key) {
                Some(v) => parse_bool(v)
                    .ok_or_else(|| invalid(format!("parameter {} is not a boolean: {:?}", key, v))),
                None => Ok(false),
            }
        };

        let access_key = parameters
            .get("accessKey")
            .map(String::as_str)
            .unwrap_or(DEFAULT_ACCESS_KEY);
        let secret_key = parameters
            .get("secretKey")
            .map(String::as_str)
            .unwrap_or(DEFAULT_SECRET_KEY);
        let static_keys = match (credentials.get(access_key), credentials.get(secret_key)) {
            (Some(a), Some(s)) => Some((a.clone(), s.clone())),
            _ => None,
        };

        Ok(Self {
            bucket,
            endpoint,
            region: parameters
                .get("region")
                .cloned()
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            insecure: flag("insecure")?,
            force_path_style: flag("s3ForcePathStyle")?,
            static_keys,
        })
    }

    fn builder(&self) -> AmazonS3Builder {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&self.bucket)
            .with_region(&self.region)
            .with_allow_http(self.insecure);
        if let Some((access, secret)) = &self.static_keys {
            builder = builder
                .with_access_key_id(access)
                .with_secret_access_key(secret);
        }
        match &self.endpoint {
            // custom endpoints carry no bucket, so requests stay path-style
            Some(endpoint) => builder.with_endpoint(endpoint),
            None => builder.with_virtual_hosted_style_request(!self.force_path_style),
        }
    }
}

/// Build an S3 provider without touching the network
pub fn build(
    storage: &str,
    parameters: &BTreeMap<String, String>,
    credentials: &BTreeMap<String, String>,
) -> Result<ObjectStoreProvider, Error> {
    let config = S3Config::parse(storage, parameters, credentials)?;
    let store = config
        .builder()
        .build()
        .map_err(|e| Error::provider_permanent(storage, "s3", format!("failed to configure client: {}", e)))?;
    Ok(ObjectStoreProvider::new(storage, ProviderKind::S3, Arc::new(store)))
}

fn is_valid_endpoint(endpoint: &str) -> bool {
    let rest = match endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
    {
        Some(rest) => rest,
        None => return false,
    };
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_bucket_is_mandatory() {
        let err = S3Config::parse("minio", &params(&[("region", "eu")]), &BTreeMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("mandatory bucket parameter is not defined"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_defaults() {
        let config = S3Config::parse("aws", &params(&[("bucket", "b")]), &BTreeMap::new()).unwrap();
        assert_eq!(config.region, "us-east-1");
        assert!(!config.insecure);
        assert!(!config.force_path_style);
        assert!(config.endpoint.is_none());
        assert!(config.static_keys.is_none());
    }

    #[test]
    fn test_endpoint_shape() {
        assert!(is_valid_endpoint("http://minio.minio:9000"));
        assert!(is_valid_endpoint("https://10.0.0.1:443"));
        assert!(!is_valid_endpoint("minio:9000"));
        assert!(!is_valid_endpoint("http://minio"));
        assert!(!is_valid_endpoint("http://minio:port"));
        assert!(!is_valid_endpoint("http://:9000"));

        let err = S3Config::parse(
            "minio",
            &params(&[("bucket", "b"), ("endpoint", "minio:9000")]),
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("http(s)://host:port"));
    }

    #[test]
    fn test_flags_must_be_booleans() {
        let config = S3Config::parse(
            "minio",
            &params(&[("bucket", "b"), ("insecure", "true"), ("s3ForcePathStyle", "1")]),
            &BTreeMap::new(),
        )
        .unwrap();
        assert!(config.insecure);
        assert!(config.force_path_style);

        assert!(S3Config::parse(
            "minio",
            &params(&[("bucket", "b"), ("insecure", "yes")]),
            &BTreeMap::new(),
        )
        .is_err());
    }

    #[test]
    fn test_credentials_use_configured_key_names() {
        let creds = params(&[("user", "minio"), ("pass", "minio123")]);
        let config = S3Config::parse(
            "minio",
            &params(&[("bucket", "b"), ("accessKey", "user"), ("secretKey", "pass")]),
            &creds,
        )
        .unwrap();
        assert_eq!(
            config.static_keys,
            Some(("minio".to_string(), "minio123".to_string()))
        );

        // an incomplete pair falls back to the ambient environment
        let partial = params(&[("AWS_ACCESS_KEY_ID", "minio")]);
        let config = S3Config::parse("minio", &params(&[("bucket", "b")]), &partial).unwrap();
        assert!(config.static_keys.is_none());
    }

    #[test]
    fn test_build_does_not_connect() {
        let provider = build(
            "minio",
            &params(&[("bucket", "b"), ("endpoint", "http://127.0.0.1:9"), ("insecure", "true")]),
            &params(&[("AWS_ACCESS_KEY_ID", "a"), ("AWS_SECRET_ACCESS_KEY", "s")]),
        );
        assert!(provider.is_ok());
    }
}
