//! `passthrough` authentication plugin

use async_trait::async_trait;
use serde::Deserialize;

use super::default_port;
use crate::error::Result;
use crate::plugins::AuthPlugin;
use crate::server::Session;

/// Config for the `passthrough` plugin
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PassthroughConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed databases; empty allows all
    #[serde(default)]
    pub databases: Vec<String>,
}

/// Dials the configured upstream and forwards the client's startup message
/// unchanged.
///
/// The upstream's authentication exchange is then relayed by the proxy
/// like any other traffic; the gateway never sees a credential.
#[derive(Debug)]
pub struct Passthrough {
    config: PassthroughConfig,
}

impl Passthrough {
    pub fn new(config: PassthroughConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AuthPlugin for Passthrough {
    async fn authenticate(&self, session: &mut Session) -> Result<bool> {
        session.dial_to_s(&self.config.host, self.config.port).await?;

        let startup = session.startup().clone();
        session.write_startup_to_server(&startup).await?;
        Ok(true)
    }

    fn allowed_databases(&self, _user: &str) -> &[String] {
        &self.config.databases
    }
}
