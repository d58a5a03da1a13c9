//! Authentication material for the CONNECT handshake: user / password, tokens, and NKey based
//!  signatures of the server's nonce (directly, via JWT, or via a credentials file).

pub mod credentials;
pub mod creds_file;
pub mod nkey;
