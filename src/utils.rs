//! Utility functions for bulk proxy and credential import.

use log::warn;
use reqwest::Client;

use crate::error::Result;
use crate::proxy::ProxyDescriptor;

/// Fetch the raw text of a list from a URL or file path.
pub(crate) async fn fetch_source(source: &str) -> Result<String> {
    if source.starts_with("http") {
        let client = Client::new();
        let response = client.get(source).send().await?.error_for_status()?;
        Ok(response.text().await?)
    } else {
        Ok(tokio::fs::read_to_string(source).await?)
    }
}

fn lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Parse `address:port[:username[:password]]` entries, one per line.
///
/// A leading `socks5://` is accepted. Lines with a missing or invalid port
/// are skipped.
pub fn parse_proxy_list(content: &str) -> Vec<ProxyDescriptor> {
    lines(content)
        .filter_map(|line| {
            let line = line.strip_prefix("socks5://").unwrap_or(line);
            let mut fields = line.split(':');
            let address = fields.next().filter(|a| !a.is_empty())?;
            let port = match fields.next().map(str::parse::<u16>) {
                Some(Ok(port)) => port,
                _ => {
                    warn!("Skipping malformed proxy entry: {}", line);
                    return None;
                }
            };

            let mut proxy = ProxyDescriptor::new(address, port);
            proxy.username = fields.next().filter(|f| !f.is_empty()).map(str::to_string);
            proxy.password = fields.next().filter(|f| !f.is_empty()).map(str::to_string);
            Some(proxy)
        })
        .collect()
}

/// Parse one credential per line.
pub fn parse_credential_list(content: &str) -> Vec<String> {
    lines(content).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_proxies_with_optional_auth() {
        let content = "1.2.3.4:1080:user:pass\r\n5.6.7.8:9050\n\n# comment\nsocks5://9.9.9.9:1081:u\nbad-entry\n10.0.0.1:notaport\n";
        let proxies = parse_proxy_list(content);

        assert_eq!(proxies.len(), 3);
        assert_eq!(
            proxies[0],
            ProxyDescriptor::new("1.2.3.4", 1080).with_auth("user", "pass")
        );
        assert_eq!(proxies[1], ProxyDescriptor::new("5.6.7.8", 9050));
        assert_eq!(proxies[2].username.as_deref(), Some("u"));
        assert_eq!(proxies[2].password, None);
    }

    #[test]
    fn parses_credentials_across_line_endings() {
        let tokens = parse_credential_list("a\r\nb\n\nc\r\n");
        assert_eq!(tokens, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn reads_list_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "token-1\ntoken-2\n").unwrap();

        let content = fetch_source(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(parse_credential_list(&content).len(), 2);
    }
}
