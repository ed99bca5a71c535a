//! Network fetchers: a real HTTP client and an always-offline stand-in.

use std::time::Duration;

use async_trait::async_trait;
use http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN};
use reqwest::Client;
use tracing::{debug, info, trace};
use url::Url;

use crate::{Fetcher, NetError, Request, RequestMode, Response, ResponseType};

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Origin of the page the worker serves. Decides basic vs cross-origin.
    pub origin: Url,
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout enforced by the client.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl LoaderConfig {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            user_agent: format!("ShellCache/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Fetcher backed by `reqwest`.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = %config.origin, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    fn origin_header(&self) -> String {
        self.config.origin.origin().ascii_serialization()
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.config.origin.origin()
    }

    fn allows_origin(&self, headers: &http::HeaderMap) -> bool {
        headers
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "*" || v == self.origin_header())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let same_origin = self.is_same_origin(&request.url);
        debug!(url = %request.url, method = %request.method, mode = ?request.mode, same_origin, "Fetching");

        if !same_origin && request.mode == RequestMode::SameOrigin {
            return Err(NetError::RequestFailed(format!(
                "{} is cross-origin in same-origin mode",
                request.url
            )));
        }

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if !same_origin && request.mode == RequestMode::Cors {
            builder = builder.header(ORIGIN, self.origin_header());
        }

        let response = builder.send().await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();

        // Typed by where the response came from, which differs from the
        // request URL when a redirect left the origin.
        let response_type = if self.is_same_origin(&url) {
            ResponseType::Basic
        } else {
            match request.mode {
                RequestMode::NoCors => {
                    trace!(url = %url, "Cross-origin no-cors response is opaque");
                    return Ok(Response::opaque(url));
                }
                // The page may read a navigation that left the origin, but it
                // is not a same-origin response.
                RequestMode::Navigate => ResponseType::Cors,
                RequestMode::SameOrigin => {
                    return Err(NetError::RequestFailed(format!(
                        "{} redirected cross-origin to {url} in same-origin mode",
                        request.url
                    )));
                }
                RequestMode::Cors => {
                    if !self.allows_origin(&headers) {
                        return Err(NetError::CorsBlocked(url.to_string()));
                    }
                    ResponseType::Cors
                }
            }
        };

        let body = response.bytes().await?;

        trace!(url = %url, status, body_len = body.len(), "Response received");

        Ok(Response {
            url,
            status,
            headers,
            body,
            response_type,
        })
    }
}

/// Fetcher that rejects every request, as a device with no connectivity would.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

#[async_trait]
impl Fetcher for OfflineFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        trace!(url = %request.url, "Offline, rejecting fetch");
        Err(NetError::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher_for(server: &MockServer) -> HttpFetcher {
        let origin = Url::parse(&server.uri()).unwrap();
        HttpFetcher::new(LoaderConfig::new(origin)).unwrap()
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::new(Url::parse("https://app.example").unwrap());
        assert!(config.user_agent.starts_with("ShellCache/"));
        assert_eq!(config.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_same_origin_is_basic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>shell</html>"))
            .mount(&server)
            .await;

        let fetcher = fetcher_for(&server);
        let url = Url::parse(&format!("{}/index.html", server.uri())).unwrap();
        let response = fetcher.fetch(&Request::navigate(url)).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.response_type, ResponseType::Basic);
        assert_eq!(response.text().unwrap(), "<html>shell</html>");
    }

    #[tokio::test]
    async fn test_error_status_is_not_a_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.svg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = fetcher_for(&server);
        let url = Url::parse(&format!("{}/missing.svg", server.uri())).unwrap();
        let response = fetcher.fetch(&Request::get(url)).await.unwrap();

        assert_eq!(response.status, 404);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_cross_origin_no_cors_is_opaque() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/icon.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1, 2, 3]))
            .mount(&server)
            .await;

        let fetcher =
            HttpFetcher::new(LoaderConfig::new(Url::parse("https://app.example").unwrap())).unwrap();
        let url = Url::parse(&format!("{}/icon.png", server.uri())).unwrap();
        let response = fetcher
            .fetch(&Request::get(url).mode(RequestMode::NoCors))
            .await
            .unwrap();

        assert_eq!(response.response_type, ResponseType::Opaque);
        assert_eq!(response.status, 0);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_cross_origin_cors_requires_allow_origin() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/open.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("access-control-allow-origin", "*")
                    .set_body_string("{}"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/closed.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let fetcher =
            HttpFetcher::new(LoaderConfig::new(Url::parse("https://app.example").unwrap())).unwrap();

        let open = Url::parse(&format!("{}/open.json", server.uri())).unwrap();
        let response = fetcher.fetch(&Request::get(open)).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Cors);

        let closed = Url::parse(&format!("{}/closed.json", server.uri())).unwrap();
        let result = fetcher.fetch(&Request::get(closed)).await;
        assert!(matches!(result, Err(NetError::CorsBlocked(_))));
    }

    async fn redirect_to(app: &MockServer, cdn: &MockServer, asset: &str) {
        Mock::given(method("GET"))
            .and(path(asset))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("{}{asset}", cdn.uri())),
            )
            .mount(app)
            .await;
    }

    #[tokio::test]
    async fn test_redirect_off_origin_is_not_basic() {
        let app = MockServer::start().await;
        let cdn = MockServer::start().await;
        redirect_to(&app, &cdn, "/hero.png").await;
        redirect_to(&app, &cdn, "/open.json").await;
        Mock::given(method("GET"))
            .and(path("/hero.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7, 7, 7]))
            .mount(&cdn)
            .await;
        Mock::given(method("GET"))
            .and(path("/open.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("access-control-allow-origin", "*")
                    .set_body_string("{}"),
            )
            .mount(&cdn)
            .await;

        let fetcher = fetcher_for(&app);
        let hero = Url::parse(&format!("{}/hero.png", app.uri())).unwrap();

        let blocked = fetcher.fetch(&Request::get(hero.clone())).await;
        assert!(matches!(blocked, Err(NetError::CorsBlocked(_))));

        let opaque = fetcher
            .fetch(&Request::get(hero.clone()).mode(RequestMode::NoCors))
            .await
            .unwrap();
        assert_eq!(opaque.response_type, ResponseType::Opaque);
        assert!(opaque.body.is_empty());

        let same_origin_only = fetcher
            .fetch(&Request::get(hero.clone()).mode(RequestMode::SameOrigin))
            .await;
        assert!(matches!(same_origin_only, Err(NetError::RequestFailed(_))));

        let navigation = fetcher.fetch(&Request::navigate(hero)).await.unwrap();
        assert_eq!(navigation.response_type, ResponseType::Cors);
        assert_eq!(navigation.status, 200);

        let open = Url::parse(&format!("{}/open.json", app.uri())).unwrap();
        let cors = fetcher.fetch(&Request::get(open)).await.unwrap();
        assert_eq!(cors.response_type, ResponseType::Cors);
        assert_eq!(cors.url.as_str(), format!("{}/open.json", cdn.uri()));
    }

    #[tokio::test]
    async fn test_same_origin_mode_rejects_cross_origin() {
        let fetcher =
            HttpFetcher::new(LoaderConfig::new(Url::parse("https://app.example").unwrap())).unwrap();
        let request = Request::get(Url::parse("https://cdn.example/lib.js").unwrap())
            .mode(RequestMode::SameOrigin);
        assert!(matches!(
            fetcher.fetch(&request).await,
            Err(NetError::RequestFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_fetcher_rejects() {
        let request = Request::get(Url::parse("https://app.example/").unwrap());
        assert!(matches!(
            OfflineFetcher.fetch(&request).await,
            Err(NetError::Offline)
        ));
    }
}
