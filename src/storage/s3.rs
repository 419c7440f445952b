use super::prefix::{build_operator, PrefixStore};
use super::FingerprintSource;
use anyhow::Result;

impl PrefixStore {
    /// S3 兼容存储：一个 bucket 视为一个账户，顶层前缀视为容器
    pub fn s3(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        prefix: Option<String>,
        fingerprint: FingerprintSource,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref p) = prefix {
            builder = builder.root(p);
        }

        let operator = build_operator(builder)?;

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix
                .as_deref()
                .map(|p| format!("/{}", p.trim_matches('/')))
                .unwrap_or_default()
        );

        Ok(Self::from_operator(operator, name, fingerprint))
    }
}
