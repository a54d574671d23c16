//! Outgoing request assembly.

use crate::{Result, Url, UrlFlags};
use std::io::Write;

/// How much of the requesting page the `Referer` header discloses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefererPolicy {
    /// No `Referer` header at all.
    None,
    /// Scheme and authority only (`scheme://authority/`).
    #[default]
    Host,
    /// Scheme, authority and full path.
    Path,
}

/// Proxy settings, as resolved for one request.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// `Proxy-Authorization` credentials, already base64-encoded.
    pub auth_base64: Option<String>,
}

/// Everything the request builder needs besides the URL itself.
///
/// Cookie and authorization values arrive pre-formatted: retrieving them
/// involves policy decisions (first-party checks, realm lookup) that
/// belong to their own modules.
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    /// The page that caused this request; `None` when user-initiated.
    pub requester: Option<Url>,
    /// Referer disclosure policy.
    pub referer: RefererPolicy,
    /// `Accept-Language` value, when configured.
    pub language: Option<String>,
    /// `User-Agent` value.
    pub user_agent: String,
    /// `Authorization` value, when credentials are known for this URL.
    pub auth: Option<String>,
    /// `Cookie` line, when the cookie policy allows any.
    pub cookies: Option<String>,
    /// Proxy settings; `Some` means the request goes through the proxy.
    pub proxy: Option<ProxyConfig>,
}

/// The `Content-Type` of a POST submission.
fn post_content_type(url: &Url) -> String {
    if url.flags().contains(UrlFlags::MULTIPART_ENC) {
        // Boundary lines in the payload have "--" prepended; recover the
        // boundary from the first one.
        let mut boundary = "0";
        if url.data().len() > 2 {
            let body = &url.data()[2..];
            if let Some(eol) = memchr::memchr(b'\r', body) {
                boundary = std::str::from_utf8(&body[..eol]).unwrap_or("0");
            }
        }
        format!("multipart/form-data; boundary=\"{boundary}\"")
    } else {
        "application/x-www-form-urlencoded".to_string()
    }
}

fn request_target(url: &Url, via_proxy: bool) -> String {
    if via_proxy {
        // Absolute URI, fragment stripped.
        let s = url.as_str();
        match s.find('#') {
            Some(pos) => s[..pos].to_string(),
            None => s.to_string(),
        }
    } else {
        match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        }
    }
}

fn referer_line(url: &Url, params: &RequestParams) -> Option<String> {
    let requester = params.requester.as_ref()?;
    match params.referer {
        RefererPolicy::None => None,
        RefererPolicy::Host => Some(format!(
            "{}://{}/",
            requester.scheme(),
            requester.authority()
        )),
        RefererPolicy::Path => Some(format!(
            "{}://{}{}",
            requester.scheme(),
            requester.authority(),
            requester.path()
        )),
    }
    .filter(|_| url.host().is_some())
}

/// Builds the complete request: head, blank line and, for POST, the body.
pub fn build_request(url: &Url, params: &RequestParams) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(512);
    let via_proxy = params.proxy.is_some();
    let target = request_target(url, via_proxy);
    let post = url.flags().contains(UrlFlags::POST);

    write!(buf, "{} {} HTTP/1.1\r\n", if post { "POST" } else { "GET" }, target)?;
    if url.flags().contains(UrlFlags::E2E_RELOAD) {
        write!(buf, "Cache-Control: no-cache\r\nPragma: no-cache\r\n")?;
    }
    write!(buf, "Connection: close\r\n")?;
    write!(buf, "Accept-Charset: utf-8,*;q=0.8\r\n")?;
    write!(buf, "Accept-Encoding: gzip\r\n")?;
    if let Some(language) = &params.language {
        write!(buf, "Accept-Language: {language}\r\n")?;
    }
    if let Some(auth) = &params.auth {
        write!(buf, "Authorization: {auth}\r\n")?;
    }
    write!(buf, "Host: {}\r\n", url.authority())?;
    if let Some(proxy) = &params.proxy {
        if let Some(credentials) = &proxy.auth_base64 {
            write!(buf, "Proxy-Authorization: Basic {credentials}\r\n")?;
        }
    }
    if let Some(referer) = referer_line(url, params) {
        write!(buf, "Referer: {referer}\r\n")?;
    }
    write!(buf, "User-Agent: {}\r\n", params.user_agent)?;
    if post {
        write!(buf, "Content-Length: {}\r\n", url.data().len())?;
        write!(buf, "Content-Type: {}\r\n", post_content_type(url))?;
    }
    if let Some(cookies) = &params.cookies {
        write!(buf, "Cookie: {cookies}\r\n")?;
    }
    write!(buf, "\r\n")?;
    if post {
        buf.extend_from_slice(url.data());
    }

    log::trace!(
        "{}",
        String::from_utf8_lossy(&buf).replace("\r\n", "\r\n> ")
    );
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params() -> RequestParams {
        RequestParams {
            user_agent: "Larkspur/0.1".into(),
            ..RequestParams::default()
        }
    }

    #[test]
    fn plain_get_has_canonical_header_order() {
        let url = Url::parse("http://example.test/a?b=c", None).unwrap();
        let request = build_request(&url, &params()).unwrap();
        let text = String::from_utf8(request).unwrap();
        assert_eq!(
            text,
            "GET /a?b=c HTTP/1.1\r\n\
             Connection: close\r\n\
             Accept-Charset: utf-8,*;q=0.8\r\n\
             Accept-Encoding: gzip\r\n\
             Host: example.test\r\n\
             User-Agent: Larkspur/0.1\r\n\
             \r\n"
        );
    }

    #[test]
    fn reload_adds_cache_bypass_headers() {
        let url = Url::parse("http://example.test/", None)
            .unwrap()
            .with_flags(UrlFlags::E2E_RELOAD);
        let text = String::from_utf8(build_request(&url, &params()).unwrap()).unwrap();
        assert!(text.starts_with(
            "GET / HTTP/1.1\r\nCache-Control: no-cache\r\nPragma: no-cache\r\n"
        ));
    }

    #[test]
    fn post_carries_length_type_and_body() {
        let mut url = Url::parse("http://example.test/submit", None).unwrap();
        url.add_flags(UrlFlags::POST);
        url.set_data(b"a=1&b=2".to_vec());
        let text = String::from_utf8(build_request(&url, &params()).unwrap()).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(text.ends_with("\r\n\r\na=1&b=2"));
    }

    #[test]
    fn multipart_boundary_is_recovered_from_payload() {
        let mut url = Url::parse("http://example.test/upload", None).unwrap();
        url.add_flags(UrlFlags::POST | UrlFlags::MULTIPART_ENC);
        url.set_data(b"--XyZ\r\ncontent\r\n--XyZ--\r\n".to_vec());
        let text = String::from_utf8(build_request(&url, &params()).unwrap()).unwrap();
        assert!(text.contains("Content-Type: multipart/form-data; boundary=\"XyZ\"\r\n"));
    }

    #[test]
    fn referer_policies() {
        let url = Url::parse("http://b.test/page", None).unwrap();
        let requester = Url::parse("http://a.test/secret/path?q", None).unwrap();

        let mut p = params();
        p.requester = Some(requester.clone());
        p.referer = RefererPolicy::Host;
        let text = String::from_utf8(build_request(&url, &p).unwrap()).unwrap();
        assert!(text.contains("Referer: http://a.test/\r\n"));

        p.referer = RefererPolicy::Path;
        let text = String::from_utf8(build_request(&url, &p).unwrap()).unwrap();
        assert!(text.contains("Referer: http://a.test/secret/path\r\n"));

        p.referer = RefererPolicy::None;
        let text = String::from_utf8(build_request(&url, &p).unwrap()).unwrap();
        assert!(!text.contains("Referer"));
    }

    #[test]
    fn proxy_uses_absolute_target_and_credentials() {
        let url = Url::parse("http://example.test/a#frag", None).unwrap();
        let mut p = params();
        p.proxy = Some(ProxyConfig {
            auth_base64: Some("dXNlcjpwdw==".into()),
        });
        let text = String::from_utf8(build_request(&url, &p).unwrap()).unwrap();
        assert!(text.starts_with("GET http://example.test/a HTTP/1.1\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));
    }
}
