use std::path::Path;

use anyhow::{bail, Context};

/// The content of a `.creds` file: a user JWT and the NKey seed that signs for it
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UserCredentials {
    pub jwt: String,
    pub seed: String,
}

/// Parses a credentials file. Its payloads are delimited by marker lines of the form
///  `-----BEGIN ...-----` / `------END ...------`; the first non-blank line after a begin
///  marker is the payload. The first block holds the JWT, the second the seed. Everything
///  outside the blocks is commentary.
pub fn parse_credentials(contents: &str) -> anyhow::Result<UserCredentials> {
    let mut payloads = vec![];
    let mut in_block = false;
    for line in contents.lines() {
        let line = line.trim();
        if is_marker(line) {
            in_block = line.contains("BEGIN");
            continue;
        }
        if in_block && !line.is_empty() {
            payloads.push(line.to_string());
            in_block = false;
        }
    }

    let mut payloads = payloads.into_iter();
    match (payloads.next(), payloads.next()) {
        (Some(jwt), Some(seed)) => Ok(UserCredentials { jwt, seed }),
        (Some(_), None) => bail!("credentials contain a JWT but no seed"),
        _ => bail!("no JWT found in credentials"),
    }
}

fn is_marker(line: &str) -> bool {
    line.starts_with("---") && line.ends_with("---")
}

pub async fn load_credentials(path: &Path) -> anyhow::Result<UserCredentials> {
    let contents = tokio::fs::read_to_string(path).await
        .with_context(|| format!("could not read credentials file {}", path.display()))?;
    parse_credentials(&contents)
        .with_context(|| format!("invalid credentials file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREDS: &str = "-----BEGIN NATS USER JWT-----
eyJ0eXAiOiJqd3QiLCJhbGciOiJlZDI1NTE5In0.payload.sig
------END NATS USER JWT------

************************* IMPORTANT *************************
NKEY Seed printed below can be used to sign and prove identity.

-----BEGIN USER NKEY SEED-----

SUAGMJH5XLGZKQQWAWKRZJIGMOU4HPFUYLXJMXOO5NLFEO2OOQJ5LPRDPM
------END USER NKEY SEED------
";

    #[test]
    fn test_parse_credentials() {
        let creds = parse_credentials(CREDS).unwrap();
        assert_eq!(creds.jwt, "eyJ0eXAiOiJqd3QiLCJhbGciOiJlZDI1NTE5In0.payload.sig");
        assert_eq!(creds.seed, "SUAGMJH5XLGZKQQWAWKRZJIGMOU4HPFUYLXJMXOO5NLFEO2OOQJ5LPRDPM");
    }

    #[test]
    fn test_missing_seed() {
        let err = parse_credentials("-----BEGIN NATS USER JWT-----\nabc\n------END NATS USER JWT------\n").unwrap_err();
        assert!(err.to_string().contains("no seed"));
    }

    #[test]
    fn test_empty() {
        assert!(parse_credentials("").is_err());
        assert!(parse_credentials("just some text\n").is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load_credentials(Path::new("/nonexistent/user.creds")).await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/user.creds"));
    }
}
