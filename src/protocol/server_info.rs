use serde::{Deserialize, Serialize};

/// Identifies this client in CONNECT
pub const CLIENT_LANG: &str = "rust";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The payload of a server's INFO operation. Fields the server sends but this client does not
///  know about are ignored, and all fields are optional on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub go: String,
    pub host: String,
    pub port: u16,
    /// whether the server supports HPUB / HMSG
    pub headers: bool,
    pub max_payload: usize,
    pub proto: i8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_connect_urls: Option<Vec<String>>,
    /// lame duck mode: the server is shutting down and wants clients to go elsewhere
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ldm: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jetstream: Option<bool>,
}
impl ServerInfo {
    pub fn is_lame_duck(&self) -> bool {
        self.ldm.unwrap_or(false)
    }

    pub fn requires_tls(&self) -> bool {
        self.tls_required.unwrap_or(false)
    }

    /// cluster addresses advertised by the server, matching the kind of transport in use
    pub fn advertised_urls(&self, websocket: bool) -> &[String] {
        let urls = if websocket { &self.ws_connect_urls } else { &self.connect_urls };
        urls.as_deref().unwrap_or(&[])
    }
}

/// The payload of the client's CONNECT operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    #[serde(default)]
    pub protocol: u8,
    #[serde(default)]
    pub echo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_responders: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<bool>,
}
impl Default for ConnectInfo {
    fn default() -> Self {
        ConnectInfo::new()
    }
}
impl ConnectInfo {
    /// `protocol` 1 announces support for dynamic cluster updates (INFO after CONNECT)
    pub fn new() -> ConnectInfo {
        ConnectInfo {
            verbose: false,
            pedantic: false,
            tls_required: false,
            auth_token: None,
            user: None,
            pass: None,
            name: None,
            lang: CLIENT_LANG.to_string(),
            version: CLIENT_VERSION.to_string(),
            protocol: 1,
            echo: true,
            sig: None,
            jwt: None,
            nkey: None,
            no_responders: None,
            headers: None,
        }
    }
}
