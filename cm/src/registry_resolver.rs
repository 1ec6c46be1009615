//! Resolves a content digest to an upstream fetch URL under a configured
//! registry base. The registry/index server
//! itself is out of scope; this is just the URL-shaping seam
//! `cm_images::UrlResolver` needs.

use async_trait::async_trait;
use cm_images::UrlResolver;
use cm_proto::CmResult;

pub struct RegistryUrlResolver {
    pub base_url: String,
}

#[async_trait]
impl UrlResolver for RegistryUrlResolver {
    async fn resolve(&self, digest: &str) -> CmResult<String> {
        // `sha256:deadbeef` -> `<base>/sha256/deadbeef`, keeping the digest
        // algorithm as a path segment rather than a literal colon.
        Ok(format!("{}/{}", self.base_url.trim_end_matches('/'), digest.replacen(':', "/", 1)))
    }
}
