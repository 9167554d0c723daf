use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::{ApiVersionConfig, CallPayload, Protocol, schema};
use crate::{GatewayError, Result};

/// A completed backend exchange. Non-2xx backend statuses are still a
/// success at this layer; only transport failures become errors, and the
/// dispatcher never interprets `data` on an error.
#[derive(Clone, Debug)]
pub struct InvokeSuccess {
    pub status: u16,
    pub data: Bytes,
    pub headers: BTreeMap<String, String>,
    pub latency_ms: u64,
}

#[async_trait]
pub trait Invoker: Send + Sync {
    async fn send(&self, version: &ApiVersionConfig, payload: &CallPayload)
    -> Result<InvokeSuccess>;
}

/// Checks the inbound payload against the version's declared parameters and
/// body shape. Pure and side-effect free: the dispatcher runs it before any
/// ledger movement.
pub fn validate_payload(version: &ApiVersionConfig, payload: &CallPayload) -> Result<()> {
    require_params(&version.header_params, &payload.headers, "header")?;
    require_params(&version.query_params, &payload.query, "query")?;
    require_params(&version.path_params, &payload.path, "path")?;

    if version.has_body {
        let body = payload.body.as_ref().ok_or_else(|| GatewayError::InvalidRequest {
            reason: "missing request body".to_string(),
        })?;
        if let Some(body_schema) = &version.body_schema {
            schema::validate(body, body_schema)?;
        }
    }
    Ok(())
}

fn require_params(
    declared: &[String],
    supplied: &BTreeMap<String, String>,
    bucket: &str,
) -> Result<()> {
    for key in declared {
        match supplied.get(key) {
            Some(value) if !value.trim().is_empty() => {}
            _ => {
                return Err(GatewayError::InvalidRequest {
                    reason: format!("missing or empty {bucket} parameter `{key}`"),
                });
            }
        }
    }
    Ok(())
}

pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::Internal {
                message: format!("backend http client error: {err}"),
            })?;
        Ok(Self { client })
    }

    async fn send_http(
        &self,
        version: &ApiVersionConfig,
        payload: &CallPayload,
    ) -> Result<InvokeSuccess> {
        let url = build_url(&version.url, &version.path_params, &version.query_params, payload);
        let method = reqwest::Method::from_bytes(version.method.to_uppercase().as_bytes())
            .map_err(|_| GatewayError::Internal {
                message: format!("invalid backend method `{}`", version.method),
            })?;
        let headers = merge_headers(&payload.headers, &version.static_headers, None)?;

        let mut request = self.client.request(method, &url).headers(headers);
        if version.has_body {
            if let Some(body) = &payload.body {
                request = request.json(body);
            }
        }
        dispatch(request).await
    }

    async fn send_soap(
        &self,
        version: &ApiVersionConfig,
        payload: &CallPayload,
    ) -> Result<InvokeSuccess> {
        let template = version
            .soap_template
            .as_ref()
            .ok_or_else(|| GatewayError::Internal {
                message: format!("soap version {} has no body template", version.version),
            })?;
        let rendered = render_soap_body(template, payload.body.as_ref());

        let url = build_url(&version.url, &version.path_params, &version.query_params, payload);
        let headers = merge_headers(&payload.headers, &version.static_headers, Some("text/xml"))?;

        let request = self
            .client
            .post(&url)
            .headers(headers)
            .body(rendered);
        dispatch(request).await
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    async fn send(
        &self,
        version: &ApiVersionConfig,
        payload: &CallPayload,
    ) -> Result<InvokeSuccess> {
        match version.protocol {
            Protocol::Http => self.send_http(version, payload).await,
            Protocol::Soap => self.send_soap(version, payload).await,
        }
    }
}

async fn dispatch(request: reqwest::RequestBuilder) -> Result<InvokeSuccess> {
    let started = Instant::now();
    let response = request.send().await.map_err(|err| GatewayError::Transport {
        message: format!("backend request failed: {err}"),
    })?;

    let status = response.status().as_u16();
    let mut headers = BTreeMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    let data = response.bytes().await.map_err(|err| GatewayError::Transport {
        message: format!("backend response read failed: {err}"),
    })?;
    let latency_ms = started.elapsed().as_millis() as u64;

    Ok(InvokeSuccess {
        status,
        data,
        headers,
        latency_ms,
    })
}

/// Substitutes `{param}` placeholders from the declared path params, then
/// appends the declared query params URL-encoded, respecting a `?` already
/// present in the base URL.
fn build_url(
    base: &str,
    path_params: &[String],
    query_params: &[String],
    payload: &CallPayload,
) -> String {
    let mut url = base.to_string();
    for key in path_params {
        if let Some(value) = payload.path.get(key) {
            url = url.replace(&format!("{{{key}}}"), value);
        }
    }

    let pairs: Vec<(&String, &String)> = query_params
        .iter()
        .filter_map(|key| payload.query.get(key).map(|value| (key, value)))
        .collect();
    if !pairs.is_empty() {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&encoded);
    }
    url
}

/// Caller headers first, static headers after: a value the service pins on
/// the version always wins over what the consumer supplied.
fn merge_headers(
    caller: &BTreeMap<String, String>,
    static_headers: &BTreeMap<String, String>,
    content_type: Option<&'static str>,
) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    if let Some(content_type) = content_type {
        map.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static(content_type),
        );
    }
    for (name, value) in caller.iter().chain(static_headers.iter()) {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            GatewayError::InvalidRequest {
                reason: format!("invalid header name `{name}`"),
            }
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| GatewayError::InvalidRequest {
            reason: format!("invalid value for header `{}`", name.as_str()),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Renders the stored SOAP template: HTML-entity unescape first, then plain
/// `{{key}}` substitution from the payload body. No expression evaluation.
fn render_soap_body(template: &str, body: Option<&serde_json::Value>) -> String {
    let mut rendered = unescape_entities(template);
    let Some(object) = body.and_then(|body| body.as_object()) else {
        return rendered;
    };
    for (key, value) in object {
        let replacement = match value {
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&format!("{{{{{key}}}}}"), &replacement);
    }
    rendered
}

fn unescape_entities(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
