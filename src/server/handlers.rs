use crate::error::RelayError;
use crate::metrics;
use crate::server::AppState;
use crate::types::{Envelope, InboundRequest};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 处理 HTTP 请求的主路由
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let request_id = uuid::Uuid::new_v4();
    let span = info_span!(
        "request",
        id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );

    let mut response = route(req, &state).instrument(span).await;
    if state.cors {
        add_cors_headers(&mut response);
    }
    Ok(response)
}

async fn route<B>(req: Request<B>, state: &AppState) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => health_check(state),
        (&Method::GET, "/metrics") => metrics_endpoint(),
        (&Method::OPTIONS, p) if state.cors && p == state.route => preflight(),
        (_, p) if p == state.route => relay_endpoint(req, state).await,
        _ => not_found(),
    }
}

/// 健康检查端点
fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let body = json!({
        "status": "ok",
        "service": "promptrelay",
        "credential_configured": state.relay.has_credential()
    });
    response(StatusCode::OK, "application/json", body.to_string())
}

/// 指标端点
fn metrics_endpoint() -> Response<Full<Bytes>> {
    let body = metrics::global_metrics().export_prometheus();
    response(StatusCode::OK, "text/plain; version=0.0.4", body)
}

/// 中继端点
async fn relay_endpoint<B>(req: Request<B>, state: &AppState) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let result = match into_inbound(req, state.max_body_bytes).await {
        Ok(inbound) => state.relay.handle(&inbound).await,
        Err(e) => {
            warn!("读取请求体失败: {}", e);
            state.relay.reject(e)
        }
    };

    metrics::global_metrics().record(&result);
    if result.is_success() {
        info!("中继成功");
    }

    envelope_response(result.status_code(), &result.envelope())
}

/// 把 hyper 请求转换为中继端点需要的视图，请求体受大小限制
async fn into_inbound<B>(req: Request<B>, limit: usize) -> Result<InboundRequest, RelayError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let (parts, body) = req.into_parts();
    let body = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                RelayError::validation(format!(
                    "El cuerpo de la solicitud supera el límite de {} bytes.",
                    limit
                ))
            } else {
                RelayError::validation(format!(
                    "No se pudo leer el cuerpo de la solicitud: {}",
                    e
                ))
            }
        })?
        .to_bytes();

    Ok(InboundRequest::new(
        parts.method,
        parts.uri.query().map(str::to_string),
        body,
    ))
}

/// CORS 预检
fn preflight() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

fn add_cors_headers(response: &mut Response<Full<Bytes>>) {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
}

/// 404 响应
fn not_found() -> Response<Full<Bytes>> {
    envelope_response(
        StatusCode::NOT_FOUND,
        &Envelope::error("Ruta no encontrada."),
    )
}

fn envelope_response(status: StatusCode, envelope: &Envelope) -> Response<Full<Bytes>> {
    let body = match serde_json::to_string(envelope) {
        Ok(body) => body,
        Err(e) => {
            error!("序列化响应失败: {}", e);
            r#"{"success":false,"error":"Error interno del servidor."}"#.to_string()
        }
    };
    response(status, "application/json", body)
}

fn response(
    status: StatusCode,
    content_type: &'static str,
    body: String,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
