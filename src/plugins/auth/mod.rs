//! Authentication plugins
//!
//! - `passthrough`: dials a fixed upstream and lets the client authenticate
//!   to it directly
//! - `iam`: checks an access-key pair against AWS IAM, then logs in to the
//!   upstream with a service account
//! - `virtualuser-authentication`: per-user credentials held by the gateway,
//!   each user mapped to a group sharing one upstream login

mod iam;
mod passthrough;
mod virtual_user;

pub use self::iam::{AwsIamVerifier, IamAuth, IamAuthConfig, IdentityVerifier};
pub use self::passthrough::{Passthrough, PassthroughConfig};
pub use self::virtual_user::{UpstreamLogin, VirtualUserAuth, VirtualUserGroup};

use super::{parse_plugin_config, AuthPlugin};
use crate::error::Result;

/// Default Postgres port for upstream targets
pub(crate) fn default_port() -> u16 {
    5432
}

/// Authentication plugins known to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPluginKind {
    Passthrough,
    Iam,
    VirtualUser,
}

impl AuthPluginKind {
    const NAMES: &'static [(&'static str, AuthPluginKind)] = &[
        ("passthrough", AuthPluginKind::Passthrough),
        ("iam", AuthPluginKind::Iam),
        ("virtualuser-authentication", AuthPluginKind::VirtualUser),
        ("virtual-user", AuthPluginKind::VirtualUser),
    ];

    /// Look a plugin up by its config name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, kind)| *kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthPluginKind::Passthrough => "passthrough",
            AuthPluginKind::Iam => "iam",
            AuthPluginKind::VirtualUser => "virtualuser-authentication",
        }
    }

    /// Build the plugin from its config blob.
    pub fn build(&self, config: &serde_yaml::Value) -> Result<Box<dyn AuthPlugin>> {
        Ok(match self {
            AuthPluginKind::Passthrough => Box::new(Passthrough::new(parse_plugin_config(config)?)),
            AuthPluginKind::Iam => Box::new(IamAuth::new(parse_plugin_config(config)?)?),
            AuthPluginKind::VirtualUser => {
                Box::new(VirtualUserAuth::new(parse_plugin_config(config)?)?)
            }
        })
    }
}
