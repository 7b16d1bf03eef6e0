//! HTTP transport (§4.A): probing a URL's resumability and fetching byte
//! ranges. One `reqwest::Client` is built per process and shared by every
//! download; connection pooling and proxy configuration live here.

use crate::error::DlmanError;
use dlman_types::{ProxyMode, Settings};
use reqwest::{Client, StatusCode};
use std::time::Duration;

const USER_AGENT: &str = concat!("dlman/", env!("CARGO_PKG_VERSION"));

/// Result of probing a URL before a download starts or resumes.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub final_url: String,
    pub size: Option<u64>,
    pub accepts_ranges: bool,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub filename_hint: Option<String>,
}

pub fn build_http_client(settings: &Settings) -> Result<Client, DlmanError> {
    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(60))
        .redirect(reqwest::redirect::Policy::limited(10));

    match settings.proxy.mode {
        ProxyMode::None => {
            builder = builder.no_proxy();
        }
        ProxyMode::System => {
            // reqwest reads HTTP_PROXY/HTTPS_PROXY/NO_PROXY from the
            // environment by default; nothing further to configure.
        }
        ProxyMode::Manual => {
            if let Some(http_proxy) = settings.proxy.http_proxy.as_deref().filter(|s| !s.is_empty())
            {
                builder = builder.proxy(configure_proxy(
                    reqwest::Proxy::http(http_proxy)
                        .map_err(|e| DlmanError::InvalidOperation(format!("invalid HTTP proxy: {e}")))?,
                    settings,
                ));
            }
            if let Some(https_proxy) = settings
                .proxy
                .https_proxy
                .as_deref()
                .filter(|s| !s.is_empty())
            {
                builder = builder.proxy(configure_proxy(
                    reqwest::Proxy::https(https_proxy)
                        .map_err(|e| DlmanError::InvalidOperation(format!("invalid HTTPS proxy: {e}")))?,
                    settings,
                ));
            }
        }
    }

    builder
        .build()
        .map_err(|e| DlmanError::InvalidOperation(format!("failed to build http client: {e}")))
}

fn configure_proxy(mut proxy: reqwest::Proxy, settings: &Settings) -> reqwest::Proxy {
    if let (Some(user), Some(pass)) = (&settings.proxy.username, &settings.proxy.password) {
        if !user.is_empty() {
            proxy = proxy.basic_auth(user, pass);
        }
    }
    proxy
}

/// Probe a URL with HEAD, falling back to a 1-byte ranged GET when HEAD
/// doesn't yield a size (common on CDNs that disable HEAD or don't report
/// Content-Length on it).
pub async fn probe(client: &Client, url: &str, headers: &[(String, String)]) -> Result<ProbeResult, DlmanError> {
    let mut request = client.head(url);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let head_response = request.send().await.map_err(DlmanError::from_reqwest)?;
    let head_status = head_response.status();
    if head_status.is_client_error() && head_status != StatusCode::METHOD_NOT_ALLOWED && head_status != StatusCode::NOT_IMPLEMENTED {
        return Err(DlmanError::ClientPermanent(format!("probe failed: {head_status}")));
    }
    if head_status.is_server_error() {
        return Err(DlmanError::NetworkTransient(format!("probe failed: {head_status}")));
    }

    let final_url = head_response.url().to_string();
    let mut accepts_ranges = header_str(&head_response, reqwest::header::ACCEPT_RANGES)
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);
    let mut size = header_value::<u64>(&head_response, reqwest::header::CONTENT_LENGTH);
    let content_type = header_str(&head_response, reqwest::header::CONTENT_TYPE).map(str::to_string);
    let etag = header_str(&head_response, reqwest::header::ETAG).map(str::to_string);
    let last_modified = header_str(&head_response, reqwest::header::LAST_MODIFIED).map(str::to_string);
    let filename_hint = header_str(&head_response, reqwest::header::CONTENT_DISPOSITION)
        .and_then(parse_content_disposition_filename)
        .or_else(|| filename_from_url(&final_url));

    if size.is_none() {
        let mut range_request = client.get(&final_url).header(reqwest::header::RANGE, "bytes=0-0");
        for (name, value) in headers {
            range_request = range_request.header(name.as_str(), value.as_str());
        }
        if let Ok(range_response) = range_request.send().await {
            match range_response.status() {
                StatusCode::PARTIAL_CONTENT => {
                    accepts_ranges = true;
                    if let Some(content_range) = header_str(&range_response, reqwest::header::CONTENT_RANGE) {
                        if let Some(total) = content_range.rsplit('/').next() {
                            if total != "*" {
                                size = total.parse::<u64>().ok();
                            }
                        }
                    }
                }
                StatusCode::OK => {
                    accepts_ranges = false;
                    size = header_value::<u64>(&range_response, reqwest::header::CONTENT_LENGTH);
                }
                _ => {}
            }
        }
    }

    Ok(ProbeResult {
        final_url,
        size,
        accepts_ranges,
        content_type,
        etag,
        last_modified,
        filename_hint,
    })
}

/// Fetch one byte range. `end` is inclusive; `None` means "to EOF".
pub async fn fetch_range(
    client: &Client,
    url: &str,
    headers: &[(String, String)],
    start: u64,
    end: Option<u64>,
) -> Result<reqwest::Response, DlmanError> {
    let range_header = match end {
        Some(end) => format!("bytes={start}-{end}"),
        None => format!("bytes={start}-"),
    };
    let mut request = client.get(url).header(reqwest::header::RANGE, range_header);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request.send().await.map_err(DlmanError::from_reqwest)?;
    let status = response.status();
    if status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT {
        Ok(response)
    } else if status.is_client_error() {
        Err(DlmanError::ClientPermanent(format!("unexpected status {status}")))
    } else {
        Err(DlmanError::NetworkTransient(format!("unexpected status {status}")))
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<&str> {
    response.headers().get(name)?.to_str().ok()
}

fn header_value<T: std::str::FromStr>(
    response: &reqwest::Response,
    name: reqwest::header::HeaderName,
) -> Option<T> {
    header_str(response, name)?.parse().ok()
}

fn parse_content_disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename*=") {
            let rest = rest.trim_start_matches("UTF-8''");
            return Some(urlencoding_decode(rest));
        }
        if let Some(rest) = part.strip_prefix("filename=") {
            return Some(rest.trim_matches('"').to_string());
        }
    }
    None
}

fn urlencoding_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next();
            let lo = bytes.next();
            if let (Some(hi), Some(lo)) = (hi, lo) {
                if let Ok(byte) = u8::from_str_radix(&format!("{}{}", hi as char, lo as char), 16) {
                    out.push(byte as char);
                    continue;
                }
            }
        }
        out.push(b as char);
    }
    out
}

fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segments = parsed.path_segments()?;
    let last = segments.last()?;
    if last.is_empty() {
        None
    } else {
        Some(last.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_filename() {
        assert_eq!(
            parse_content_disposition_filename(r#"attachment; filename="report.pdf""#),
            Some("report.pdf".to_string())
        );
    }

    #[test]
    fn parses_filename_star() {
        assert_eq!(
            parse_content_disposition_filename("attachment; filename*=UTF-8''report%20final.pdf"),
            Some("report final.pdf".to_string())
        );
    }

    #[test]
    fn falls_back_to_url_basename() {
        assert_eq!(
            filename_from_url("https://example.com/files/archive.zip?x=1"),
            Some("archive.zip".to_string())
        );
    }
}
