//! Typed clients for the remote APIs.
//!
//! One client per upstream, all sharing a single blocking HTTP client with
//! a `dcadm/<version>` user-agent and a finite per-request timeout. Every
//! operation returns either a value or a domain-tagged error: upstream
//! error responses become [`DcadmError::SdcClient`] carrying the upstream
//! tag; transport and parse failures become [`DcadmError::Internal`]. Long
//! waits are loops of short requests, never long-held connections.

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use dcadm_config::Config;
use dcadm_types::{DcadmError, Upstream};

pub mod cnapi;
pub mod imgapi;
pub mod sapi;
pub mod vmapi;
pub mod wfapi;

pub use cnapi::CnapiClient;
pub use imgapi::ImgapiClient;
pub use sapi::SapiClient;
pub use vmapi::VmapiClient;
pub use wfapi::WfapiClient;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the shared HTTP client.
pub fn build_http_client() -> Result<Client, DcadmError> {
    Client::builder()
        .user_agent(format!("dcadm/{}", env!("CARGO_PKG_VERSION")))
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| DcadmError::internal(format!("failed to build HTTP client: {e}")))
}

/// All gateway clients, initialized once at startup and passed where
/// needed. No lazy construction, no global state.
#[derive(Debug, Clone)]
pub struct SdcClients {
    pub sapi: SapiClient,
    pub vmapi: VmapiClient,
    pub cnapi: CnapiClient,
    pub imgapi: ImgapiClient,
    pub updates: ImgapiClient,
    pub wfapi: WfapiClient,
}

impl SdcClients {
    pub fn new(config: &Config) -> Result<Self, DcadmError> {
        let http = build_http_client()?;
        Ok(Self {
            sapi: SapiClient::new(http.clone(), &config.sapi_url),
            vmapi: VmapiClient::new(http.clone(), &config.vmapi_url),
            cnapi: CnapiClient::new(http.clone(), &config.cnapi_url),
            imgapi: ImgapiClient::new(http.clone(), &config.imgapi_url, Upstream::Imgapi),
            updates: ImgapiClient::new(http.clone(), &config.updates_url, Upstream::Updates),
            wfapi: WfapiClient::new(http, &config.wfapi_url),
        })
    }
}

/// Upstream error envelope: `{"code": ..., "message": ...}`.
#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Shared request plumbing for one upstream.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    http: Client,
    base: String,
    upstream: Upstream,
}

impl Endpoint {
    pub(crate) fn new(http: Client, base: &str, upstream: Upstream) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            upstream,
        }
    }

    pub(crate) fn upstream(&self) -> Upstream {
        self.upstream
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn send(&self, req: RequestBuilder, what: &str) -> Result<Response, DcadmError> {
        req.send().map_err(|e| {
            DcadmError::internal(format!("{} request failed ({what}): {e}", self.upstream))
        })
    }

    /// Map a non-success response to the domain-tagged error, reading the
    /// upstream error envelope when one is present.
    fn check(&self, resp: Response, what: &str) -> Result<Response, DcadmError> {
        let status = resp.status();
        debug!(upstream = self.upstream.as_str(), %status, what, "response");
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(envelope) => {
                let msg = envelope.message.unwrap_or_else(|| body.clone());
                match envelope.code {
                    Some(code) => format!("{code}: {msg}"),
                    None => msg,
                }
            }
            Err(_) if !body.is_empty() => body,
            Err(_) => status.to_string(),
        };

        Err(DcadmError::upstream(
            self.upstream,
            Some(status.as_u16()),
            format!("{what}: {message}"),
        ))
    }

    fn parse<T: DeserializeOwned>(&self, resp: Response, what: &str) -> Result<T, DcadmError> {
        resp.json().map_err(|e| {
            DcadmError::internal(format!(
                "failed to parse {} response ({what}): {e}",
                self.upstream
            ))
        })
    }

    pub(crate) fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<T, DcadmError> {
        let req = self.http.get(self.url(path)).query(query);
        let resp = self.send(req, what)?;
        let resp = self.check(resp, what)?;
        self.parse(resp, what)
    }

    pub(crate) fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        what: &str,
    ) -> Result<T, DcadmError> {
        let req = self.http.post(self.url(path)).json(body);
        let resp = self.send(req, what)?;
        let resp = self.check(resp, what)?;
        self.parse(resp, what)
    }

    pub(crate) fn put_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        what: &str,
    ) -> Result<T, DcadmError> {
        let req = self.http.put(self.url(path)).json(body);
        let resp = self.send(req, what)?;
        let resp = self.check(resp, what)?;
        self.parse(resp, what)
    }

    pub(crate) fn put_ok<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        what: &str,
    ) -> Result<(), DcadmError> {
        let req = self.http.put(self.url(path)).json(body);
        let resp = self.send(req, what)?;
        self.check(resp, what)?;
        Ok(())
    }

    pub(crate) fn delete_json<T: DeserializeOwned>(
        &self,
        path: &str,
        what: &str,
    ) -> Result<T, DcadmError> {
        let req = self.http.delete(self.url(path));
        let resp = self.send(req, what)?;
        let resp = self.check(resp, what)?;
        self.parse(resp, what)
    }

    pub(crate) fn delete_ok(&self, path: &str, what: &str) -> Result<(), DcadmError> {
        let req = self.http.delete(self.url(path));
        let resp = self.send(req, what)?;
        self.check(resp, what)?;
        Ok(())
    }

    /// Stream a response body to a file, returning the byte count.
    pub(crate) fn download(&self, path: &str, dest: &Path, what: &str) -> Result<u64, DcadmError> {
        let req = self.http.get(self.url(path));
        let resp = self.send(req, what)?;
        let mut resp = self.check(resp, what)?;

        let mut file = File::create(dest).map_err(|e| {
            DcadmError::internal(format!("failed to create {}: {e}", dest.display()))
        })?;
        io::copy(&mut resp, &mut file).map_err(|e| {
            DcadmError::internal(format!(
                "failed to write download to {}: {e}",
                dest.display()
            ))
        })
    }

    /// GET that distinguishes 404 (Ok(None)) from other failures.
    pub(crate) fn get_json_opt<T: DeserializeOwned>(
        &self,
        path: &str,
        what: &str,
    ) -> Result<Option<T>, DcadmError> {
        let req = self.http.get(self.url(path));
        let resp = self.send(req, what)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = self.check(resp, what)?;
        Ok(Some(self.parse(resp, what)?))
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{json_response, with_server};
    use super::*;

    fn endpoint(base: &str) -> Endpoint {
        Endpoint::new(build_http_client().expect("client"), base, Upstream::Sapi)
    }

    #[test]
    fn get_json_parses_success() {
        let (base, handle) = with_server(|req| {
            assert_eq!(req.url(), "/things");
            req.respond(json_response(r#"[1,2,3]"#)).expect("respond");
        });

        let values: Vec<u32> = endpoint(&base)
            .get_json("/things", &[], "list things")
            .expect("get");
        assert_eq!(values, vec![1, 2, 3]);
        handle.join().expect("join");
    }

    #[test]
    fn error_envelope_maps_to_domain_tagged_error() {
        let (base, handle) = with_server(|req| {
            let resp = tiny_http::Response::from_string(
                r#"{"code":"ResourceNotFound","message":"no such service"}"#,
            )
            .with_status_code(tiny_http::StatusCode(404));
            req.respond(resp).expect("respond");
        });

        let err = endpoint(&base)
            .get_json::<Vec<u32>>("/things", &[], "list things")
            .expect_err("404 must fail");
        match &err {
            DcadmError::SdcClient {
                upstream,
                status,
                message,
            } => {
                assert_eq!(*upstream, Upstream::Sapi);
                assert_eq!(*status, Some(404));
                assert!(message.contains("ResourceNotFound"));
                assert!(message.contains("no such service"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_not_found());
        handle.join().expect("join");
    }

    #[test]
    fn non_json_error_body_is_preserved() {
        let (base, handle) = with_server(|req| {
            let resp = tiny_http::Response::from_string("gateway exploded")
                .with_status_code(tiny_http::StatusCode(502));
            req.respond(resp).expect("respond");
        });

        let err = endpoint(&base)
            .get_json::<Vec<u32>>("/things", &[], "list things")
            .expect_err("502 must fail");
        assert!(err.to_string().contains("gateway exploded"));
        handle.join().expect("join");
    }

    #[test]
    fn transport_failure_is_internal() {
        let ep = endpoint("http://127.0.0.1:1");
        let err = ep
            .get_json::<Vec<u32>>("/things", &[], "list things")
            .expect_err("connection refused");
        assert!(matches!(err, DcadmError::Internal(_)));
        assert!(err.to_string().contains("list things"));
    }

    #[test]
    fn parse_failure_is_internal() {
        let (base, handle) = with_server(|req| {
            req.respond(json_response("not json at all"))
                .expect("respond");
        });

        let err = endpoint(&base)
            .get_json::<Vec<u32>>("/things", &[], "list things")
            .expect_err("bad payload");
        assert!(matches!(err, DcadmError::Internal(_)));
        handle.join().expect("join");
    }

    #[test]
    fn get_json_opt_returns_none_for_404() {
        let (base, handle) = with_server(|req| {
            req.respond(tiny_http::Response::empty(tiny_http::StatusCode(404)))
                .expect("respond");
        });

        let found: Option<Vec<u32>> = endpoint(&base)
            .get_json_opt("/things/x", "get thing")
            .expect("optional get");
        assert!(found.is_none());
        handle.join().expect("join");
    }

    #[test]
    fn download_writes_body_to_file() {
        let (base, handle) = with_server(|req| {
            req.respond(tiny_http::Response::from_string("binary-ish payload"))
                .expect("respond");
        });

        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("artifact");
        let bytes = endpoint(&base)
            .download("/file", &dest, "download artifact")
            .expect("download");
        assert_eq!(bytes, "binary-ish payload".len() as u64);
        assert_eq!(
            std::fs::read_to_string(&dest).expect("read"),
            "binary-ish payload"
        );
        handle.join().expect("join");
    }
}
