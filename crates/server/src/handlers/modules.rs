//! Module proxy protocol handlers.
//!
//! Module paths contain slashes and are followed by `/@v/<version>.<ext>`,
//! which the router cannot express, so every request that misses a fixed
//! route lands in [`module_request`] and is split by hand.

use crate::error::{ApiError, ApiResult};
use crate::metrics::RequestTimer;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Uri, header};
use axum::response::{IntoResponse, Response};
use modproxy_core::{Info, unescape_path, unescape_version};
use modproxy_resolver::DataStream;
use percent_encoding::percent_decode_str;

const CONTENT_TYPE_INFO: &str = "application/json";
const CONTENT_TYPE_TEXT: &str = "text/plain; charset=UTF-8";
const CONTENT_TYPE_ZIP: &str = "application/zip";

/// A decoded module proxy request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyRequest {
    Latest { path: String },
    List { path: String },
    Info { path: String, version: String },
    GoMod { path: String, version: String },
    Zip { path: String, version: String },
}

impl ProxyRequest {
    /// Parse a (percent-decoded) request path such as
    /// `/github.com/!azure/go-autorest/@v/v1.0.0.info`.
    pub fn parse(request_path: &str) -> ApiResult<Self> {
        let Some(at) = request_path.find("/@") else {
            return Err(ApiError::InvalidRequestPath(
                "request path must contain a component starting with an @ character".to_string(),
            ));
        };
        let escaped = &request_path[..at];
        let escaped = escaped.strip_prefix('/').unwrap_or(escaped);
        let path = unescape_path(escaped).map_err(|e| {
            ApiError::InvalidRequestPath(format!("module path {escaped:?} is incorrectly encoded: {e}"))
        })?;

        match &request_path[at + 2..] {
            "latest" => Ok(Self::Latest { path }),
            "v/list" => Ok(Self::List { path }),
            rest => {
                let Some(file) = rest.strip_prefix("v/") else {
                    return Err(ApiError::InvalidRequestPath(format!(
                        "unexpected request {rest:?}"
                    )));
                };
                let Some((raw_version, ext)) = file.rsplit_once('.') else {
                    return Err(ApiError::InvalidRequestPath(format!(
                        "no file extension in file name {file:?}"
                    )));
                };
                let version = unescape_version(raw_version).map_err(|e| {
                    ApiError::InvalidRequestPath(format!(
                        "version {raw_version:?} is incorrectly encoded: {e}"
                    ))
                })?;
                match ext {
                    "info" => Ok(Self::Info { path, version }),
                    "mod" => Ok(Self::GoMod { path, version }),
                    "zip" => Ok(Self::Zip { path, version }),
                    other => Err(ApiError::InvalidRequestPath(format!(
                        "unexpected extension {other:?}"
                    ))),
                }
            }
        }
    }

    /// Metric label for this request.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Latest { .. } => "latest",
            Self::List { .. } => "list",
            Self::Info { .. } => "info",
            Self::GoMod { .. } => "mod",
            Self::Zip { .. } => "zip",
        }
    }
}

/// Fallback handler serving the module proxy protocol.
pub async fn module_request(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET {
        return ApiError::MethodNotAllowed.into_response();
    }
    let request = match decode_request_path(uri.path()).and_then(|p| ProxyRequest::parse(&p)) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    let timer = RequestTimer::start(request.operation());
    let response = match tokio::time::timeout(state.request_timeout(), serve(&state, &request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            if let ApiError::NotFound(message) = &e {
                tracing::debug!(request = ?request, message = %message, "not found");
            }
            e.into_response()
        }
        Err(_) => {
            tracing::warn!(request = ?request, "request timed out");
            ApiError::Timeout.into_response()
        }
    };
    timer.finish(response.status());
    response
}

async fn serve(state: &AppState, request: &ProxyRequest) -> ApiResult<Response> {
    let engine = &state.engine;
    let response = match request {
        ProxyRequest::Latest { path } => info_response(&engine.latest(path).await?)?,
        ProxyRequest::List { path } => {
            let body = engine.list(path).await?;
            ([(header::CONTENT_TYPE, CONTENT_TYPE_TEXT)], body).into_response()
        }
        ProxyRequest::Info { path, version } => info_response(&engine.info(path, version).await?)?,
        ProxyRequest::GoMod { path, version } => {
            stream_response(CONTENT_TYPE_TEXT, engine.go_mod(path, version).await?)
        }
        ProxyRequest::Zip { path, version } => {
            stream_response(CONTENT_TYPE_ZIP, engine.zip(path, version).await?)
        }
    };
    Ok(response)
}

fn info_response(info: &Info) -> ApiResult<Response> {
    let body = info
        .to_json()
        .map_err(|e| ApiError::Internal(format!("failed to encode info: {e}")))?;
    Ok(([(header::CONTENT_TYPE, CONTENT_TYPE_INFO)], body).into_response())
}

fn stream_response(content_type: &'static str, data: DataStream) -> Response {
    ([(header::CONTENT_TYPE, content_type)], Body::from_stream(data)).into_response()
}

fn decode_request_path(raw: &str) -> ApiResult<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|p| p.into_owned())
        .map_err(|e| ApiError::InvalidRequestPath(format!("request path is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(p: &str) -> ProxyRequest {
        ProxyRequest::parse(p).unwrap()
    }

    #[test]
    fn parses_every_protocol_request() {
        assert_eq!(
            parse("/github.com/!azure/go-autorest/@v/list"),
            ProxyRequest::List {
                path: "github.com/Azure/go-autorest".to_string()
            }
        );
        assert_eq!(
            parse("/example.com/a/@latest"),
            ProxyRequest::Latest {
                path: "example.com/a".to_string()
            }
        );
        assert_eq!(
            parse("/example.com/a/@v/v1.0.0-!r!c1.info"),
            ProxyRequest::Info {
                path: "example.com/a".to_string(),
                version: "v1.0.0-RC1".to_string()
            }
        );
        assert_eq!(
            parse("/example.com/a/@v/v1.0.0.mod").operation(),
            "mod"
        );
        assert_eq!(
            parse("/example.com/a/@v/v2.0.0+incompatible.zip"),
            ProxyRequest::Zip {
                path: "example.com/a".to_string(),
                version: "v2.0.0+incompatible".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        for p in [
            "/example.com/a",
            "/example.com/a/@v/v1.0.0",
            "/example.com/a/@v/v1.0.0.tar",
            "/example.com/a/@w/list",
            "/@v/list",
            "/Example.com/a/@v/list",
        ] {
            let err = ProxyRequest::parse(p).unwrap_err();
            assert!(matches!(err, ApiError::InvalidRequestPath(_)), "{p}");
        }
    }

    #[test]
    fn decodes_percent_escapes() {
        assert_eq!(
            decode_request_path("/example.com/a/@v/v1.0.0%2Bincompatible.zip").unwrap(),
            "/example.com/a/@v/v1.0.0+incompatible.zip"
        );
    }
}
