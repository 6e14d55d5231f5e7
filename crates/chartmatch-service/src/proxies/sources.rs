//! Fetching candidate addresses from configured proxy-list sources.

use chartmatch_sources::{JsonSourceConfig, PlainSourceConfig, ProxySourceConfig};

/// Errors fetching a candidate list from one source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The HTTP request itself failed.
    #[error("fetching the list failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The response did not have the configured shape.
    #[error("malformed source response: {0}")]
    Malformed(&'static str),
}

/// Fetches the candidate addresses a source currently advertises.
pub(crate) async fn fetch_candidates(
    client: &reqwest::Client,
    source: &ProxySourceConfig,
) -> Result<Vec<String>, SourceError> {
    match source {
        ProxySourceConfig::Json(cfg) => fetch_json(client, cfg).await,
        ProxySourceConfig::Plain(cfg) => fetch_plain(client, cfg).await,
    }
}

async fn fetch_json(
    client: &reqwest::Client,
    cfg: &JsonSourceConfig,
) -> Result<Vec<String>, SourceError> {
    let response = client
        .get(cfg.url.clone())
        .send()
        .await?
        .error_for_status()?;
    let body: serde_json::Value = response.json().await?;
    parse_json_body(&body, cfg)
}

async fn fetch_plain(
    client: &reqwest::Client,
    cfg: &PlainSourceConfig,
) -> Result<Vec<String>, SourceError> {
    let body = client
        .get(cfg.url.clone())
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(parse_plain_body(&body))
}

/// Extracts `ip:port` addresses from a JSON response object.
///
/// Records missing the configured keys are skipped, the port may be either a string
/// or a number. Only a missing or non-array list key is a hard error.
fn parse_json_body(
    body: &serde_json::Value,
    cfg: &JsonSourceConfig,
) -> Result<Vec<String>, SourceError> {
    let records = body
        .get(&cfg.list_key)
        .and_then(|value| value.as_array())
        .ok_or(SourceError::Malformed(
            "candidate list key missing or not an array",
        ))?;

    let mut addresses = Vec::new();
    for record in records {
        let Some(ip) = record.get(&cfg.ip_key).and_then(|value| value.as_str()) else {
            continue;
        };
        let port = match record.get(&cfg.port_key) {
            Some(serde_json::Value::String(port)) => port.clone(),
            Some(serde_json::Value::Number(port)) => port.to_string(),
            _ => continue,
        };
        if !ip.is_empty() && !port.is_empty() {
            addresses.push(format!("{ip}:{port}"));
        }
    }
    Ok(addresses)
}

/// Extracts `ip:port` addresses from a plain-text list, one per line.
fn parse_plain_body(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.contains(':'))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn json_cfg(list_key: &str) -> JsonSourceConfig {
        serde_yaml::from_str(&format!(
            r#"
                id: test-source
                url: "https://proxies.example/api"
                list_key: {list_key}
            "#
        ))
        .unwrap()
    }

    #[test]
    fn test_parse_json_body() {
        let body = json!({
            "proxies": [
                {"ip": "10.0.0.1", "port": "8080"},
                {"ip": "10.0.0.2", "port": 3128},
            ]
        });
        let addresses = parse_json_body(&body, &json_cfg("proxies")).unwrap();
        assert_eq!(addresses, vec!["10.0.0.1:8080", "10.0.0.2:3128"]);
    }

    #[test]
    fn test_parse_json_body_skips_incomplete_records() {
        let body = json!({
            "data": [
                {"ip": "10.0.0.1"},
                {"port": 3128},
                {"ip": "10.0.0.3", "port": null},
                {"ip": "10.0.0.4", "port": "1080"},
            ]
        });
        let addresses = parse_json_body(&body, &json_cfg("data")).unwrap();
        assert_eq!(addresses, vec!["10.0.0.4:1080"]);
    }

    #[test]
    fn test_parse_json_body_missing_list_key() {
        let body = json!({"error": "rate limited"});
        let result = parse_json_body(&body, &json_cfg("proxies"));
        assert!(matches!(result, Err(SourceError::Malformed(_))));
    }

    #[test]
    fn test_parse_plain_body() {
        let body = "10.0.0.1:8080\n\n  10.0.0.2:3128  \nnot-an-address\n";
        let addresses = parse_plain_body(body);
        assert_eq!(addresses, vec!["10.0.0.1:8080", "10.0.0.2:3128"]);
    }
}
