use std::time::Duration;

use anyhow::bail;
use rustls::pki_types::CertificateDer;

use crate::auth::credentials::Credentials;
use crate::transport::server_address::ServerAddress;

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Seed servers. Servers the cluster advertises at runtime are added to these, but
    ///  never replace them.
    pub servers: Vec<ServerAddress>,
    pub credentials: Option<Credentials>,
    /// client name reported to the server, shows up in its monitoring
    pub name: Option<String>,

    /// Covers opening the transport and the whole handshake up to the server's first PONG.
    ///  Also bounds how long operations wait for a connection while reconnecting.
    pub connect_timeout: Duration,

    /// upgrade to TLS even if the server does not require it
    pub tls_required: bool,
    /// trusted in addition to the platform's native roots
    pub tls_root_certificates: Vec<CertificateDer<'static>>,

    pub verbose: bool,
    pub pedantic: bool,
    /// receive messages this connection published itself
    pub echo: bool,
    /// ask the server for an immediate 503 status reply if a request has no responders
    pub no_responders: bool,

    /// Operations are coalesced in a buffer that is written when it reaches this size or when
    ///  `flush_interval` has passed since the first unwritten operation, whichever comes first
    pub write_buffer_limit: usize,
    pub flush_interval: Duration,
    /// number of operations that can be queued for the writer before senders are slowed down
    pub write_queue_capacity: usize,

    pub ping_interval: Duration,
    /// The connection is considered stale (and closed as an I/O failure) if this many pings are
    ///  outstanding when the next keepalive ping is due
    pub max_pings_outstanding: u32,

    /// Consecutive failed connection attempts after which the client gives up. `None` retries
    ///  forever.
    pub max_reconnects: Option<u32>,
    pub reconnect_delay: Duration,
    /// how long a server that announced lame duck mode is avoided
    pub lame_duck_backoff: Duration,

    pub request_timeout: Duration,
    pub drain_timeout: Duration,
    pub inbox_prefix: String,

    /// grace period before an idle subscription is unsubscribed, so that briefly detaching and
    ///  reattaching consumers does not cause wire traffic
    pub unsubscribe_debounce: Duration,
    /// Per consumer. Messages arriving for a consumer whose buffer is full are dropped, and
    ///  reported as a slow consumer.
    pub subscription_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(servers: Vec<ServerAddress>) -> ConnectionConfig {
        ConnectionConfig {
            servers,
            credentials: None,
            name: None,
            connect_timeout: Duration::from_secs(5),
            tls_required: false,
            tls_root_certificates: vec![],
            verbose: false,
            pedantic: false,
            echo: true,
            no_responders: true,
            write_buffer_limit: 64 * 1024,
            flush_interval: Duration::from_millis(1),
            write_queue_capacity: 1024,
            ping_interval: Duration::from_secs(120),
            max_pings_outstanding: 2,
            max_reconnects: Some(60),
            reconnect_delay: Duration::from_secs(2),
            lame_duck_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
            inbox_prefix: "_INBOX".to_string(),
            unsubscribe_debounce: Duration::from_millis(500),
            subscription_capacity: 65536,
        }
    }

    /// parses a comma separated list of server URLs
    pub fn from_urls(urls: &str) -> anyhow::Result<ConnectionConfig> {
        Ok(ConnectionConfig::new(ServerAddress::parse_list(urls)?))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.servers.is_empty() {
            bail!("no servers configured");
        }
        if let Some(credentials) = &self.credentials {
            credentials.validate()?;
        }
        if self.write_buffer_limit == 0 {
            bail!("write buffer limit must be positive");
        }
        if self.write_queue_capacity == 0 {
            bail!("write queue capacity must be positive");
        }
        if self.subscription_capacity == 0 {
            bail!("subscription capacity must be positive");
        }
        if self.ping_interval.is_zero() {
            bail!("ping interval must be positive");
        }
        if self.max_pings_outstanding == 0 {
            bail!("max pings outstanding must be positive");
        }
        if self.inbox_prefix.is_empty() || self.inbox_prefix.contains(char::is_whitespace) {
            bail!("invalid inbox prefix {:?}", self.inbox_prefix);
        }
        Ok(())
    }
}
