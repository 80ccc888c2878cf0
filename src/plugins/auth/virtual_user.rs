//! `virtualuser-authentication` plugin
//!
//! Users are defined in groups. Each group names one upstream login, and
//! every user of the group gets its own credential, stored as one of:
//!
//! - `SCRAM-SHA-256$<iterations>:<salt>$<StoredKey>:<ServerKey>`: the
//!   client runs a full SCRAM-SHA-256 exchange with the gateway
//! - `md5<32 hex digits>` (`md5(password + user)`): MD5 challenge-response
//! - anything else: cleartext, compared as is
//!
//! Once the client is authenticated the gateway dials the group's target
//! and logs in with the group's credentials, which the client never sees.
//!
//! ```yaml
//! virtualuser-authentication:
//!   - name: reporting
//!     target: { host: db.internal, port: 5432, user: report_owner, password: "${REPORT_PW}", databases: [reports] }
//!     users:
//!       alice: "SCRAM-SHA-256$4096:c2FsdA==$...:..."
//!       bob: "md5a3556571e93b0d20722ba62be61e8c2d"
//! ```

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::default_port;
use crate::crypto::{check_md5_user_password, parse_scram_stored_credentials, StoredCredentials};
use crate::error::{GatewayError, Result};
use crate::plugins::AuthPlugin;
use crate::server::{PasswordMethod, Session};

/// Upstream login shared by a group of virtual users
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamLogin {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub user: String,

    pub password: String,

    /// Databases the group's users may open; empty allows all
    #[serde(default)]
    pub databases: Vec<String>,
}

/// One configured group
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualUserGroup {
    pub name: String,
    pub target: UpstreamLogin,
    /// User name to stored credential
    pub users: BTreeMap<String, String>,
}

/// A user's credential as parsed at startup.
enum Credential {
    Cleartext(Zeroizing<String>),
    /// Hex digest without the `md5` prefix
    Md5(Zeroizing<String>),
    Scram(Box<StoredCredentials>),
}

impl Credential {
    fn parse(stored: &str) -> Result<Self> {
        if stored.starts_with("SCRAM-SHA-256$") {
            return Ok(Credential::Scram(Box::new(parse_scram_stored_credentials(stored)?)));
        }
        if let Some(digest) = stored.strip_prefix("md5") {
            if digest.len() == 32 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Ok(Credential::Md5(Zeroizing::new(digest.to_ascii_lowercase())));
            }
        }
        Ok(Credential::Cleartext(Zeroizing::new(stored.to_string())))
    }
}

struct Account {
    group: usize,
    credential: Credential,
}

/// Virtual users mapped onto shared upstream logins.
pub struct VirtualUserAuth {
    groups: Vec<VirtualUserGroup>,
    accounts: HashMap<String, Account>,
}

impl VirtualUserAuth {
    /// Index every user of every group.
    ///
    /// Malformed SCRAM secrets and user names defined in more than one group
    /// are rejected here, before the listener starts.
    pub fn new(groups: Vec<VirtualUserGroup>) -> Result<Self> {
        let mut accounts: HashMap<String, Account> = HashMap::new();

        for (index, group) in groups.iter().enumerate() {
            for (user, stored) in &group.users {
                if let Some(existing) = accounts.get(user) {
                    return Err(GatewayError::Config(format!(
                        "virtual user {} is defined in both groups {} and {}",
                        user, groups[existing.group].name, group.name
                    )));
                }
                let credential = Credential::parse(stored).map_err(|e| {
                    GatewayError::Config(format!(
                        "virtual user {} in group {}: {}",
                        user, group.name, e
                    ))
                })?;
                accounts.insert(
                    user.clone(),
                    Account {
                        group: index,
                        credential,
                    },
                );
            }
        }

        Ok(Self { groups, accounts })
    }

    /// Number of configured users
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Run the client-facing half. `Ok(false)` on a wrong password.
    async fn authenticate_client(&self, session: &mut Session, credential: &Credential) -> Result<bool> {
        match credential {
            Credential::Scram(stored) => {
                let stored = stored.as_ref().clone();
                session
                    .scram_sha256_client_auth(move |_user: &str| Ok(stored.clone()))
                    .await?;
                Ok(true)
            }
            Credential::Md5(digest) => {
                let (_, response) = session.get_user_password(PasswordMethod::Md5).await?;
                let Some(response_hex) = response.password().strip_prefix(b"md5") else {
                    return Ok(false);
                };
                Ok(check_md5_user_password(
                    digest.as_bytes(),
                    &session.salt(),
                    response_hex,
                ))
            }
            Credential::Cleartext(expected) => {
                let (_, response) = session.get_user_password(PasswordMethod::Cleartext).await?;
                Ok(expected.as_bytes().ct_eq(response.password()).into())
            }
        }
    }
}

#[async_trait]
impl AuthPlugin for VirtualUserAuth {
    async fn authenticate(&self, session: &mut Session) -> Result<bool> {
        let Some(account) = self.accounts.get(session.user()) else {
            debug!("unknown virtual user {}", session.user());
            return Ok(false);
        };

        if !self.authenticate_client(session, &account.credential).await? {
            return Ok(false);
        }

        let target = &self.groups[account.group].target;
        session.dial_to_s(&target.host, target.port).await?;
        session.auth_on_server(&target.user, &target.password).await?;
        Ok(true)
    }

    fn allowed_databases(&self, user: &str) -> &[String] {
        self.accounts
            .get(user)
            .map(|account| self.groups[account.group].target.databases.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{compute_md5_password, md5_user_password};
    use crate::plugins::PluginRegistry;
    use crate::protocol::{
        parse_authentication, read_message, write_message, AuthenticationRequest, PasswordMessage,
        StartupMessage,
    };
    use crate::server::NetworkStream;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    fn groups(yaml: &str) -> Vec<VirtualUserGroup> {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn plugin() -> VirtualUserAuth {
        let bob_md5 = md5_user_password("bob", "bob-pw");
        let carol_scram = StoredCredentials::derive("carol-pw", b"NaCl", 4096).to_string();
        VirtualUserAuth::new(groups(&format!(
            r#"
- name: app
  target: {{ host: 127.0.0.1, port: 1, user: app_owner, password: owner-pw, databases: [app] }}
  users:
    alice: alice-pw
    bob: "{}"
- name: reports
  target: {{ host: 127.0.0.1, port: 1, user: report_owner, password: owner-pw }}
  users:
    carol: "{}"
"#,
            bob_md5, carol_scram
        )))
        .unwrap()
    }

    async fn session(user: &str) -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let session = Session::new(
            StartupMessage::with_database(user, "app"),
            NetworkStream::tcp(accepted.unwrap().0),
            false,
            Arc::new(PluginRegistry::with_plugins(None, Vec::new())),
        )
        .unwrap();
        (session, client.unwrap())
    }

    #[test]
    fn test_credential_parsing() {
        assert!(matches!(
            Credential::parse("md5a3556571e93b0d20722ba62be61e8c2d").unwrap(),
            Credential::Md5(_)
        ));
        // Not a digest, so a cleartext password that happens to start with md5
        assert!(matches!(
            Credential::parse("md5-is-my-password").unwrap(),
            Credential::Cleartext(_)
        ));
        assert!(matches!(
            Credential::parse("hunter2").unwrap(),
            Credential::Cleartext(_)
        ));
        let scram = StoredCredentials::derive("pw", b"salt", 4096).to_string();
        assert!(matches!(
            Credential::parse(&scram).unwrap(),
            Credential::Scram(_)
        ));
        assert!(Credential::parse("SCRAM-SHA-256$broken").is_err());
    }

    #[test]
    fn test_index_and_allow_list() {
        let plugin = plugin();
        assert_eq!(plugin.len(), 3);
        assert_eq!(plugin.allowed_databases("alice"), ["app"]);
        assert_eq!(plugin.allowed_databases("bob"), ["app"]);
        assert!(plugin.allowed_databases("carol").is_empty());
        assert!(plugin.allowed_databases("mallory").is_empty());
    }

    #[test]
    fn test_duplicate_user_rejected() {
        let err = VirtualUserAuth::new(groups(
            r#"
- name: one
  target: { host: a, user: u, password: p }
  users: { dave: x }
- name: two
  target: { host: b, user: u, password: p }
  users: { dave: y }
"#,
        ))
        .err()
        .unwrap();
        assert!(err
            .to_string()
            .contains("virtual user dave is defined in both groups one and two"));
    }

    #[test]
    fn test_bad_scram_secret_rejected() {
        let err = VirtualUserAuth::new(groups(
            r#"
- name: one
  target: { host: a, user: u, password: p }
  users: { erin: "SCRAM-SHA-256$abc:c2FsdA==$a:b" }
"#,
        ))
        .err()
        .unwrap();
        assert!(err.to_string().contains("virtual user erin in group one"));
    }

    #[tokio::test]
    async fn test_unknown_user_fails_without_challenge() {
        let plugin = plugin();
        let (mut session, _client) = session("mallory").await;
        assert!(!plugin.authenticate(&mut session).await.unwrap());
        assert!(session.password().is_none());
    }

    #[tokio::test]
    async fn test_md5_wrong_password() {
        let plugin = plugin();
        let (mut session, mut client) = session("bob").await;

        let client_side = tokio::spawn(async move {
            let challenge = read_message(&mut client).await.unwrap();
            let AuthenticationRequest::Md5Password { salt } =
                parse_authentication(&challenge.payload).unwrap()
            else {
                panic!("expected MD5 challenge");
            };
            let response = compute_md5_password("bob", "not-bob-pw", &salt);
            write_message(&mut client, &PasswordMessage::from_password(&response).to_message())
                .await
                .unwrap();
            client
        });

        assert!(!plugin.authenticate(&mut session).await.unwrap());
        assert!(!session.has_target());
        client_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_cleartext_wrong_password() {
        let plugin = plugin();
        let (mut session, mut client) = session("alice").await;

        let client_side = tokio::spawn(async move {
            let challenge = read_message(&mut client).await.unwrap();
            assert_eq!(
                parse_authentication(&challenge.payload).unwrap(),
                AuthenticationRequest::CleartextPassword
            );
            write_message(&mut client, &PasswordMessage::from_password("alice-pw!").to_message())
                .await
                .unwrap();
            client
        });

        assert!(!plugin.authenticate(&mut session).await.unwrap());
        client_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_correct_password_dials_group_target() {
        let plugin = plugin();
        let (mut session, mut client) = session("alice").await;

        let client_side = tokio::spawn(async move {
            let _challenge = read_message(&mut client).await.unwrap();
            write_message(&mut client, &PasswordMessage::from_password("alice-pw").to_message())
                .await
                .unwrap();
            client
        });

        // Port 1 refuses connections, so success shows up as a dial error
        let err = plugin.authenticate(&mut session).await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));
        assert_eq!(session.password(), Some(&b"alice-pw"[..]));
        client_side.await.unwrap();
    }
}
