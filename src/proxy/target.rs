//! The fixed origin every request is forwarded to.

use http::uri::{Authority, PathAndQuery, Scheme};
use http::Uri;
use thiserror::Error;
use url::Url;

/// Error type for target parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("{url:?} is not an absolute URL: {source}")]
    Parse {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported scheme {0:?} (expected http or https)")]
    UnsupportedScheme(String),

    #[error("{0:?} has no host")]
    MissingHost(String),

    #[error("{0:?} cannot be used as a request authority")]
    InvalidAuthority(String),
}

/// Scheme, authority and optional path/query prefix of the origin.
///
/// Parsed once at startup and shared read-only by every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    scheme: Scheme,
    authority: Authority,
    host: String,
    path: String,
    query: Option<String>,
}

impl Target {
    /// Parse an absolute `http` or `https` URL.
    pub fn parse(input: &str) -> Result<Self, TargetError> {
        let url = Url::parse(input).map_err(|source| TargetError::Parse {
            url: input.to_string(),
            source,
        })?;
        Self::from_url(&url)
    }

    /// Build a target from an already parsed URL.
    pub fn from_url(url: &Url) -> Result<Self, TargetError> {
        let scheme = match url.scheme() {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => return Err(TargetError::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TargetError::MissingHost(url.to_string()))?
            .to_string();

        // `Url` drops default ports, so the authority mirrors what was written.
        let authority_str = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        let authority = authority_str
            .parse::<Authority>()
            .map_err(|_| TargetError::InvalidAuthority(authority_str))?;

        // A bare origin ("http://host") parses with path "/", which must not
        // add a trailing slash to forwarded paths.
        let path = match url.path() {
            "/" => String::new(),
            p => p.to_string(),
        };

        Ok(Self {
            scheme,
            authority,
            host,
            path,
            query: url.query().filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Host name or IP literal, without port.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// Rewrite an inbound request URI so it addresses the target.
    ///
    /// Scheme and authority are replaced. The target path is joined in front
    /// of the inbound path with a single slash, and queries are concatenated.
    pub fn rewrite_uri(&self, inbound: &Uri) -> Result<Uri, http::Error> {
        let path = join_paths(&self.path, inbound.path());
        let query = match (self.query.as_deref(), inbound.query()) {
            (Some(a), Some(b)) if !b.is_empty() => Some(format!("{a}&{b}")),
            (Some(a), _) => Some(a.to_string()),
            (None, Some(b)) => Some(b.to_string()),
            (None, None) => None,
        };

        let path_and_query = match query {
            Some(q) => format!("{path}?{q}"),
            None => path,
        };

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query.parse::<PathAndQuery>()?)
            .build()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)
    }
}

fn join_paths(prefix: &str, path: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    if prefix.is_empty() {
        return path.to_string();
    }
    match (prefix.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{prefix}{}", &path[1..]),
        (false, false) => format!("{prefix}/{path}"),
        _ => format!("{prefix}{path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn parses_plain_origin() {
        let target = Target::parse("http://127.0.0.1:8000").unwrap();
        assert_eq!(target.scheme(), &Scheme::HTTP);
        assert_eq!(target.authority().as_str(), "127.0.0.1:8000");
        assert_eq!(target.host(), "127.0.0.1");
        assert!(!target.is_tls());
        assert_eq!(target.to_string(), "http://127.0.0.1:8000");
    }

    #[test]
    fn https_target_keeps_written_authority() {
        let target = Target::parse("https://origin.example").unwrap();
        assert!(target.is_tls());
        assert_eq!(target.authority().as_str(), "origin.example");
    }

    #[test]
    fn rejects_unusable_urls() {
        assert!(matches!(
            Target::parse("127.0.0.1:8000"),
            Err(TargetError::Parse { .. })
        ));
        assert_eq!(
            Target::parse("ftp://origin"),
            Err(TargetError::UnsupportedScheme("ftp".into()))
        );
        assert!(matches!(
            Target::parse("localhost:8000"),
            Err(TargetError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn rewrite_replaces_scheme_and_authority_only() {
        let target = Target::parse("https://origin:9443").unwrap();
        let out = target
            .rewrite_uri(&uri("http://proxy.local:8001/a/b?x=1&y=2"))
            .unwrap();
        assert_eq!(out.to_string(), "https://origin:9443/a/b?x=1&y=2");

        let out = target.rewrite_uri(&uri("/")).unwrap();
        assert_eq!(out.to_string(), "https://origin:9443/");
    }

    #[test]
    fn rewrite_joins_target_prefix() {
        let target = Target::parse("http://origin/api").unwrap();
        assert_eq!(
            target.rewrite_uri(&uri("/users")).unwrap().to_string(),
            "http://origin/api/users"
        );

        let target = Target::parse("http://origin/api/").unwrap();
        assert_eq!(
            target.rewrite_uri(&uri("/users")).unwrap().to_string(),
            "http://origin/api/users"
        );
        assert_eq!(
            target.rewrite_uri(&uri("/")).unwrap().to_string(),
            "http://origin/api/"
        );
    }

    #[test]
    fn rewrite_merges_queries() {
        let target = Target::parse("http://origin/?key=abc").unwrap();
        assert_eq!(
            target.rewrite_uri(&uri("/q?page=2")).unwrap().to_string(),
            "http://origin/q?key=abc&page=2"
        );
        assert_eq!(
            target.rewrite_uri(&uri("/q")).unwrap().to_string(),
            "http://origin/q?key=abc"
        );
    }

    #[test]
    fn join_paths_uses_single_slash() {
        assert_eq!(join_paths("", "/x"), "/x");
        assert_eq!(join_paths("", ""), "/");
        assert_eq!(join_paths("/a", "/x"), "/a/x");
        assert_eq!(join_paths("/a/", "/x"), "/a/x");
        assert_eq!(join_paths("/a", "x"), "/a/x");
    }
}
