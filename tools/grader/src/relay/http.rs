//! Message mode: one request/response exchange per unit.

use super::{RelayContext, RelaySettings};
use crate::logging::append_run_log;
use crate::types::Side;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpStream;

#[derive(Clone)]
pub(crate) struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Forwarder {
    pub(crate) fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Replays the request against the real server and buffers the whole reply.
    async fn forward(
        &self,
        settings: &RelaySettings,
        parts: hyper::http::request::Parts,
        body: Bytes,
    ) -> Result<Response<Bytes>, String> {
        let path = parts
            .uri
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("http://{}{path}", settings.upstream_addr)
            .parse()
            .map_err(|e| format!("invalid upstream uri: {e}"))?;

        let mut upstream = Request::new(Full::new(body));
        *upstream.method_mut() = parts.method;
        *upstream.uri_mut() = uri;
        copy_end_to_end_headers(&parts.headers, upstream.headers_mut());

        let exchange = async {
            let response = self
                .client
                .request(upstream)
                .await
                .map_err(|e| format!("upstream request failed: {e}"))?;
            let (parts, body) = response.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| format!("upstream body failed: {e}"))?
                .to_bytes();
            Ok::<_, String>(Response::from_parts(parts, bytes))
        };
        tokio::time::timeout(settings.forward_timeout, exchange)
            .await
            .map_err(|_| {
                format!(
                    "upstream timed out after {}ms",
                    settings.forward_timeout.as_millis()
                )
            })?
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::HOST
        || name == header::CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == header::CONTENT_LENGTH
        || name == header::TE
        || name == header::TRAILER
        || name == header::UPGRADE
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

fn copy_end_to_end_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if !is_hop_by_hop(name) {
            to.append(name.clone(), value.clone());
        }
    }
}

fn bad_gateway(message: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message)));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

async fn relay_request(context: &RelayContext, request: Request<Incoming>) -> Response<Full<Bytes>> {
    let (parts, body) = request.into_parts();
    let method = parts.method.as_str().to_string();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(error) => {
            let message = format!("request body failed: {error}");
            context.record_failure(&method, &message);
            return bad_gateway(message);
        }
    };
    context.record(Side::Server, &method, &body, None);

    match context.forwarder.forward(&context.settings, parts, body).await {
        Ok(upstream) => {
            let (parts, bytes) = upstream.into_parts();
            context.record(
                Side::Client,
                &method,
                &bytes,
                Some(parts.status.as_u16().to_string()),
            );
            let mut response = Response::new(Full::new(bytes));
            *response.status_mut() = parts.status;
            copy_end_to_end_headers(&parts.headers, response.headers_mut());
            response
        }
        Err(error) => {
            context.record_failure(&method, &error);
            bad_gateway(error)
        }
    }
}

pub(crate) async fn serve_connection(stream: TcpStream, context: Arc<RelayContext>) {
    let service = service_fn(move |request| {
        let context = Arc::clone(&context);
        async move { Ok::<_, Infallible>(relay_request(&context, request).await) }
    });
    if let Err(error) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        append_run_log(
            "debug",
            "relay.connection.error",
            json!({ "error": error.to_string() }),
        );
    }
}
