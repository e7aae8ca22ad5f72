//! Fixed loopback discovery for local and ephemeral clusters

use std::fmt;

use async_trait::async_trait;

use super::consul::LOCAL_PROXY_ENDPOINT;
use super::MasterDiscovery;
use crate::Result;

/// Always answers with the loopback endpoint
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticDiscovery;

impl fmt::Display for StaticDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("static")
    }
}

#[async_trait]
impl MasterDiscovery for StaticDiscovery {
    async fn control_plane_endpoint(&self) -> Result<String> {
        Ok(LOCAL_PROXY_ENDPOINT.to_string())
    }

    async fn external_endpoints(&self) -> Result<Vec<String>> {
        Ok(vec!["localhost".to_string()])
    }
}
