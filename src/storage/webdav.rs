use super::prefix::{build_operator, PrefixStore};
use super::FingerprintSource;
use anyhow::Result;

impl PrefixStore {
    /// WebDAV 存储：根目录下的一级集合视为容器
    pub fn webdav(
        endpoint: &str,
        username: &str,
        password: &str,
        root: Option<String>,
        fingerprint: FingerprintSource,
    ) -> Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(username)
            .password(password);

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        let operator = build_operator(builder)?;

        let name = format!(
            "webdav://{}{}",
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/'),
            root.as_deref()
                .map(|r| format!("/{}", r.trim_matches('/')))
                .unwrap_or_default()
        );

        Ok(Self::from_operator(operator, name, fingerprint))
    }
}
