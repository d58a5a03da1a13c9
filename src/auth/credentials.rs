use std::path::{Path, PathBuf};

use anyhow::bail;
use tracing::debug;

use crate::auth::creds_file::load_credentials;
use crate::auth::nkey::KeyPair;
use crate::protocol::server_info::ConnectInfo;
use crate::transport::server_address::ServerAddress;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PasswordAuth {
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JwtAuth {
    pub jwt: String,
    pub seed: String,
}

/// Several authentication mechanisms combined. The password part is independent of the others,
///  while at most one of JWT, credentials file and NKey contributes signing material, in that
///  order of precedence.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CustomAuth {
    pub password: Option<PasswordAuth>,
    pub token: Option<String>,
    pub jwt: Option<JwtAuth>,
    pub file: Option<PathBuf>,
    pub nkey: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Credentials {
    Password(PasswordAuth),
    Token(String),
    Jwt(JwtAuth),
    /// an NKey seed
    Nkey(String),
    /// path of a `.creds` file holding a JWT and a seed
    File(PathBuf),
    Custom(CustomAuth),
}
impl Credentials {
    /// rejects blank signing material, which would otherwise only fail during a handshake
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            Credentials::Jwt(jwt) => validate_jwt(jwt),
            Credentials::Nkey(seed) => validate_seed(seed),
            Credentials::Custom(custom) => {
                if let Some(jwt) = &custom.jwt {
                    validate_jwt(jwt)?;
                }
                if let Some(seed) = &custom.nkey {
                    validate_seed(seed)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn validate_jwt(jwt: &JwtAuth) -> anyhow::Result<()> {
    if jwt.jwt.trim().is_empty() {
        bail!("blank JWT");
    }
    validate_seed(&jwt.seed)
}

fn validate_seed(seed: &str) -> anyhow::Result<()> {
    if seed.trim().is_empty() {
        bail!("blank NKey seed");
    }
    Ok(())
}

/// The authentication fields of CONNECT, resolved for one handshake
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResolvedAuth {
    pub user: Option<String>,
    pub pass: Option<String>,
    pub auth_token: Option<String>,
    pub jwt: Option<String>,
    pub nkey: Option<String>,
    pub sig: Option<String>,
}
impl ResolvedAuth {
    pub fn apply_to(self, connect: &mut ConnectInfo) {
        connect.user = self.user;
        connect.pass = self.pass;
        connect.auth_token = self.auth_token;
        connect.jwt = self.jwt;
        connect.nkey = self.nkey;
        connect.sig = self.sig;
    }
}

/// Resolves configured credentials against the server's nonce. Signatures can only be produced
///  if the server sent a nonce: without one, JWT and NKey are still announced, but unsigned.
///
/// User name and password embedded in the server address are used whenever the configured
///  credentials do not provide them.
pub async fn resolve(credentials: Option<&Credentials>, nonce: Option<&str>, addr: &ServerAddress) -> anyhow::Result<ResolvedAuth> {
    let resolved = match credentials {
        None => password_auth(None, addr),
        Some(Credentials::Password(p)) => password_auth(Some(p), addr),
        Some(Credentials::Token(token)) => ResolvedAuth {
            auth_token: Some(token.clone()),
            ..password_auth(None, addr)
        },
        Some(Credentials::Jwt(jwt)) => jwt_auth(&jwt.jwt, &jwt.seed, nonce)?,
        Some(Credentials::Nkey(seed)) => nkey_auth(seed, nonce)?,
        Some(Credentials::File(path)) => file_auth(path, nonce).await?,
        Some(Credentials::Custom(custom)) => {
            let signing = if let Some(jwt) = &custom.jwt {
                Some(jwt_auth(&jwt.jwt, &jwt.seed, nonce)?)
            }
            else if let Some(path) = &custom.file {
                Some(file_auth(path, nonce).await?)
            }
            else if let Some(seed) = &custom.nkey {
                Some(nkey_auth(seed, nonce)?)
            }
            else {
                None
            };

            let mut resolved = password_auth(custom.password.as_ref(), addr);
            resolved.auth_token = custom.token.clone();
            if let Some(signing) = signing {
                resolved.jwt = signing.jwt;
                resolved.nkey = signing.nkey;
                resolved.sig = signing.sig;
            }
            resolved
        }
    };
    debug!(
        user = resolved.user.is_some(),
        token = resolved.auth_token.is_some(),
        jwt = resolved.jwt.is_some(),
        nkey = resolved.nkey.is_some(),
        signed = resolved.sig.is_some(),
        "resolved authentication"
    );
    Ok(resolved)
}

fn non_blank(s: Option<&String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty()).cloned()
}

fn password_auth(password: Option<&PasswordAuth>, addr: &ServerAddress) -> ResolvedAuth {
    let user = non_blank(password.and_then(|p| p.user.as_ref()))
        .or_else(|| non_blank(addr.user.as_ref()));
    let pass = non_blank(password.and_then(|p| p.password.as_ref()))
        .or_else(|| non_blank(addr.password.as_ref()));
    ResolvedAuth {
        user,
        pass,
        ..Default::default()
    }
}

fn jwt_auth(jwt: &str, seed: &str, nonce: Option<&str>) -> anyhow::Result<ResolvedAuth> {
    let sig = match nonce {
        Some(nonce) => Some(KeyPair::from_seed(seed)?.sign_base64(nonce.as_bytes())),
        None => None,
    };
    Ok(ResolvedAuth {
        jwt: Some(jwt.to_string()),
        sig,
        ..Default::default()
    })
}

fn nkey_auth(seed: &str, nonce: Option<&str>) -> anyhow::Result<ResolvedAuth> {
    let key_pair = KeyPair::from_seed(seed)?;
    Ok(ResolvedAuth {
        nkey: Some(key_pair.public_key()),
        sig: nonce.map(|n| key_pair.sign_base64(n.as_bytes())),
        ..Default::default()
    })
}

async fn file_auth(path: &Path, nonce: Option<&str>) -> anyhow::Result<ResolvedAuth> {
    let creds = load_credentials(path).await?;
    jwt_auth(&creds.jwt, &creds.seed, nonce)
}
