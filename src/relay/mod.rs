//! 提示词中继端点
//!
//! 一次调用：校验凭据和请求、提取提示词、调用一次 provider、
//! 返回统一的 [`RelayResult`]。所有失败都在这里转换为结果，不会向上传播。

use crate::config::{Config, Transport};
use crate::error::{ErrorKind, RelayError};
use crate::providers::gemini::GeminiProvider;
use crate::providers::Provider;
use crate::types::{Envelope, InboundRequest, PromptRequest};
use crate::Result;
use hyper::{Method, StatusCode};
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

type Connector = Box<dyn Fn(&str) -> Result<Arc<dyn Provider>> + Send + Sync>;

/// 一次调用的终态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// 包括配置错误，二者都在网络调用之前产生
    ValidationError,
    ProviderError,
}

/// 中继结果：成功时携带生成文本，失败时携带错误
#[derive(Debug)]
pub enum RelayResult {
    Success(String),
    Failure(RelayError),
}

impl RelayResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RelayResult::Success(_))
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            RelayResult::Success(_) => Outcome::Success,
            RelayResult::Failure(e) => match e.kind() {
                ErrorKind::Configuration | ErrorKind::Validation => Outcome::ValidationError,
                ErrorKind::Provider => Outcome::ProviderError,
            },
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayResult::Success(_) => StatusCode::OK,
            RelayResult::Failure(e) => e.status_code(),
        }
    }

    pub fn envelope(&self) -> Envelope {
        match self {
            RelayResult::Success(text) => Envelope::success(text.as_str()),
            RelayResult::Failure(e) => Envelope::error(e.to_string()),
        }
    }
}

/// 中继端点的运行参数
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub transport: Transport,
    pub prompt_field: String,
    pub model: String,
    pub timeout: Duration,
    /// 凭据所在的环境变量名，仅用于错误消息
    pub credential_env: String,
}

impl From<&Config> for RelaySettings {
    fn from(config: &Config) -> Self {
        Self {
            transport: config.transport,
            prompt_field: config.prompt_field.clone(),
            model: config.provider.model.clone(),
            timeout: config.provider.timeout(),
            credential_env: config.provider.api_key_env.clone(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

pub struct Relay {
    settings: RelaySettings,
    credential: Option<String>,
    connect: Connector,
    // 首次使用时构造，之后只读
    provider: OnceCell<Arc<dyn Provider>>,
}

impl Relay {
    /// `connect` 在第一次需要 provider 时以凭据调用一次
    pub fn new<F>(settings: RelaySettings, credential: Option<String>, connect: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<dyn Provider>> + Send + Sync + 'static,
    {
        Self {
            settings,
            credential,
            connect: Box::new(connect),
            provider: OnceCell::new(),
        }
    }

    /// 使用已构造好的 provider
    pub fn with_provider(
        settings: RelaySettings,
        credential: Option<String>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self::new(settings, credential, move |_| Ok(Arc::clone(&provider)))
    }

    /// 使用 Gemini provider，按配置懒加载
    pub fn from_config(config: &Config, credential: Option<String>) -> Self {
        let provider_config = config.provider.clone();
        Self::new(RelaySettings::from(config), credential, move |key| {
            let provider = GeminiProvider::new(key, &provider_config)?;
            Ok(Arc::new(provider) as Arc<dyn Provider>)
        })
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    /// 处理一次中继请求
    pub async fn handle(&self, req: &InboundRequest) -> RelayResult {
        self.finish(self.relay(req).await)
    }

    /// 请求在到达中继之前就已失败，例如请求体无法读取
    ///
    /// 缺少凭据时仍返回配置错误，与 [`Relay::handle`] 的检查顺序一致。
    pub fn reject(&self, e: RelayError) -> RelayResult {
        let e = match self.credential() {
            Ok(_) => e,
            Err(missing) => missing,
        };
        self.finish(Err(e))
    }

    fn finish(&self, result: Result<String>) -> RelayResult {
        match result {
            Ok(text) => RelayResult::Success(text),
            Err(e) => {
                match e.kind() {
                    ErrorKind::Validation => warn!("请求校验失败: {}", e),
                    ErrorKind::Configuration => error!("服务端配置错误: {}", e),
                    ErrorKind::Provider => {
                        error!(model = %self.settings.model, "provider 调用失败: {}", e)
                    }
                }
                RelayResult::Failure(e)
            }
        }
    }

    fn credential(&self) -> Result<&str> {
        self.credential
            .as_deref()
            .ok_or_else(|| RelayError::MissingCredential(self.settings.credential_env.clone()))
    }

    async fn relay(&self, req: &InboundRequest) -> Result<String> {
        let credential = self.credential()?;

        let request = self.extract_prompt(req)?;
        let provider = self.provider(credential).map_err(into_provider_error)?;

        debug!(
            model = %self.settings.model,
            prompt_chars = request.prompt.chars().count(),
            "转发提示词"
        );

        let call = provider.generate(&self.settings.model, &request.prompt);
        match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(result) => result.map_err(into_provider_error),
            Err(_) => Err(RelayError::Timeout(self.settings.timeout)),
        }
    }

    fn provider(&self, credential: &str) -> Result<&Arc<dyn Provider>> {
        self.provider.get_or_try_init(|| (self.connect)(credential))
    }

    /// 按传输方式校验请求并提取提示词
    pub fn extract_prompt(&self, req: &InboundRequest) -> Result<PromptRequest> {
        let field = self.settings.prompt_field.as_str();
        let expected = match self.settings.transport {
            Transport::Get => Method::GET,
            Transport::Post => Method::POST,
        };

        if req.method != expected {
            return Err(RelayError::validation(format!(
                "Método {} no permitido; use {}.",
                req.method, expected
            )));
        }

        let prompt = match self.settings.transport {
            Transport::Get => prompt_from_query(req.query.as_deref(), field)?,
            Transport::Post => prompt_from_body(&req.body, field)?,
        };

        if prompt.trim().is_empty() {
            return Err(RelayError::validation(format!(
                "El campo '{}' no puede estar vacío.",
                field
            )));
        }

        Ok(PromptRequest {
            prompt,
            method: expected,
        })
    }
}

fn missing_field(field: &str) -> RelayError {
    RelayError::validation(format!("Falta el campo '{}' en la solicitud.", field))
}

fn prompt_from_query(query: Option<&str>, field: &str) -> Result<String> {
    let params: Vec<(String, String)> = serde_urlencoded::from_str(query.unwrap_or_default())
        .map_err(|e| {
            RelayError::validation(format!("Parámetros de consulta no válidos: {}", e))
        })?;

    params
        .into_iter()
        .find(|(key, _)| key == field)
        .map(|(_, value)| value)
        .ok_or_else(|| missing_field(field))
}

fn prompt_from_body(body: &[u8], field: &str) -> Result<String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(RelayError::validation(format!(
            "Falta el cuerpo de la solicitud; envíe un JSON con el campo '{}'.",
            field
        )));
    }

    let value: Value = serde_json::from_slice(body).map_err(|e| {
        RelayError::validation(format!("El cuerpo de la solicitud no es JSON válido: {}", e))
    })?;

    let Value::Object(mut object) = value else {
        return Err(RelayError::validation(
            "El cuerpo de la solicitud debe ser un objeto JSON.",
        ));
    };

    match object.remove(field) {
        None | Some(Value::Null) => Err(missing_field(field)),
        Some(Value::String(prompt)) => Ok(prompt),
        Some(_) => Err(RelayError::validation(format!(
            "El campo '{}' debe ser una cadena de texto.",
            field
        ))),
    }
}

/// provider 返回的任何错误都按 provider 失败处理
fn into_provider_error(e: RelayError) -> RelayError {
    match e.kind() {
        ErrorKind::Provider => e,
        _ => RelayError::provider(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Echo,
        Reply(&'static str),
        Fail(&'static str),
        Hang,
    }

    struct StubProvider {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn generate(&self, _model: &str, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Echo => Ok(prompt.to_string()),
                Behavior::Reply(text) => Ok(text.to_string()),
                Behavior::Fail(message) => Err(RelayError::provider(*message)),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(String::new())
                }
            }
        }
    }

    fn settings(transport: Transport) -> RelaySettings {
        RelaySettings {
            transport,
            ..RelaySettings::default()
        }
    }

    fn relay(transport: Transport, stub: &Arc<StubProvider>) -> Relay {
        Relay::with_provider(
            settings(transport),
            Some("test-key".to_string()),
            stub.clone() as Arc<dyn Provider>,
        )
    }

    fn post_json(value: Value) -> InboundRequest {
        InboundRequest::post(value.to_string())
    }

    #[tokio::test]
    async fn test_echo_returns_prompt() {
        let stub = StubProvider::new(Behavior::Echo);
        let relay = relay(Transport::Post, &stub);

        let prompts = [
            "Hola mundo",
            "x",
            "  espacios alrededor  ",
            "línea 1\nlínea 2",
            r#"comillas "dobles" y \barras\"#,
            "你好，世界 🌍",
        ];
        for prompt in prompts {
            let result = relay
                .handle(&post_json(serde_json::json!({ "prompt": prompt })))
                .await;
            assert_eq!(result.status_code(), StatusCode::OK);
            assert_eq!(result.envelope(), Envelope::success(prompt));
        }
        assert_eq!(stub.calls(), prompts.len());
    }

    #[tokio::test]
    async fn test_example_hola_mundo() {
        let stub = StubProvider::new(Behavior::Reply("Hola!"));
        let relay = relay(Transport::Post, &stub);

        let result = relay
            .handle(&InboundRequest::post(r#"{"prompt":"Hola mundo"}"#))
            .await;
        assert_eq!(result.status_code(), StatusCode::OK);
        assert_eq!(result.outcome(), Outcome::Success);
        assert_eq!(
            serde_json::to_string(&result.envelope()).unwrap(),
            r#"{"success":true,"data":"Hola!"}"#
        );
    }

    #[tokio::test]
    async fn test_get_transport_reads_query() {
        let stub = StubProvider::new(Behavior::Echo);
        let relay = relay(Transport::Get, &stub);

        let result = relay
            .handle(&InboundRequest::get("prompt=Hola%20mundo%3F&otro=1"))
            .await;
        assert_eq!(result.envelope(), Envelope::success("Hola mundo?"));

        let result = relay.handle(&InboundRequest::get("prompt=a+b")).await;
        assert_eq!(result.envelope(), Envelope::success("a b"));
    }

    #[tokio::test]
    async fn test_missing_prompt_is_rejected() {
        let stub = StubProvider::new(Behavior::Echo);
        let post = relay(Transport::Post, &stub);
        let get = relay(Transport::Get, &stub);

        let cases = [
            (&post, post_json(serde_json::json!({}))),
            (&post, post_json(serde_json::json!({ "prompt": null }))),
            (&post, post_json(serde_json::json!({ "otro": "hola" }))),
            (&get, InboundRequest::get("")),
            (&get, InboundRequest::get("otro=hola")),
            (&get, InboundRequest::new(Method::GET, None, "")),
        ];
        for (relay, request) in cases {
            let result = relay.handle(&request).await;
            assert_eq!(result.status_code(), StatusCode::BAD_REQUEST);
            let envelope = result.envelope();
            assert!(!envelope.success);
            assert!(envelope.data.is_none());
            let message = envelope.error.unwrap();
            assert!(message.starts_with("Falta el campo 'prompt'"), "{}", message);
        }
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected() {
        let stub = StubProvider::new(Behavior::Echo);
        let relay = relay(Transport::Post, &stub);

        for prompt in ["", "   ", "\n\t"] {
            let result = relay
                .handle(&post_json(serde_json::json!({ "prompt": prompt })))
                .await;
            assert_eq!(result.status_code(), StatusCode::BAD_REQUEST);
            assert!(result.envelope().error.unwrap().contains("no puede estar vacío"));
        }
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let stub = StubProvider::new(Behavior::Echo);
        let relay = relay(Transport::Post, &stub);

        let result = relay.handle(&InboundRequest::post("{\"prompt\": ")).await;
        assert_eq!(result.status_code(), StatusCode::BAD_REQUEST);
        assert!(result.envelope().error.unwrap().contains("no es JSON válido"));

        let result = relay.handle(&InboundRequest::post("[\"prompt\"]")).await;
        assert_eq!(result.status_code(), StatusCode::BAD_REQUEST);
        assert!(result.envelope().error.unwrap().contains("objeto JSON"));

        let result = relay.handle(&post_json(serde_json::json!({ "prompt": 42 }))).await;
        assert_eq!(result.status_code(), StatusCode::BAD_REQUEST);
        assert!(result.envelope().error.unwrap().contains("cadena de texto"));

        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_body_is_distinct_from_missing_field() {
        let stub = StubProvider::new(Behavior::Echo);
        let relay = relay(Transport::Post, &stub);

        let result = relay.handle(&InboundRequest::post("")).await;
        assert_eq!(result.status_code(), StatusCode::BAD_REQUEST);
        assert!(result.envelope().error.unwrap().starts_with("Falta el cuerpo"));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_wrong_method_is_rejected() {
        let stub = StubProvider::new(Behavior::Echo);
        let post = relay(Transport::Post, &stub);
        let get = relay(Transport::Get, &stub);

        let result = post.handle(&InboundRequest::get("prompt=hola")).await;
        assert_eq!(result.status_code(), StatusCode::BAD_REQUEST);
        assert!(result.envelope().error.unwrap().contains("use POST"));

        let put = InboundRequest::new(Method::PUT, None, r#"{"prompt":"hola"}"#);
        assert_eq!(post.handle(&put).await.status_code(), StatusCode::BAD_REQUEST);

        let result = get.handle(&InboundRequest::post(r#"{"prompt":"hola"}"#)).await;
        assert_eq!(result.status_code(), StatusCode::BAD_REQUEST);
        assert!(result.envelope().error.unwrap().contains("use GET"));

        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_credential_never_calls_provider() {
        let stub = StubProvider::new(Behavior::Echo);
        let relay = Relay::with_provider(
            settings(Transport::Post),
            None,
            stub.clone() as Arc<dyn Provider>,
        );
        assert!(!relay.has_credential());

        let requests = [
            InboundRequest::post(r#"{"prompt":"Hola mundo"}"#),
            InboundRequest::post(""),
            InboundRequest::post("not json"),
            InboundRequest::get("prompt=hola"),
        ];
        for request in &requests {
            let result = relay.handle(request).await;
            assert_eq!(result.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(result.outcome(), Outcome::ValidationError);
            let message = result.envelope().error.unwrap();
            assert!(message.contains("GEMINI_API_KEY"), "{}", message);
        }
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_is_relayed() {
        let stub = StubProvider::new(Behavior::Fail("Resource has been exhausted"));
        let relay = relay(Transport::Post, &stub);

        let result = relay
            .handle(&InboundRequest::post(r#"{"prompt":"Hola mundo"}"#))
            .await;
        assert_eq!(result.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(result.outcome(), Outcome::ProviderError);
        let envelope = result.envelope();
        assert!(!envelope.success);
        assert!(envelope
            .error
            .unwrap()
            .contains("Resource has been exhausted"));
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn test_provider_timeout() {
        let stub = StubProvider::new(Behavior::Hang);
        let relay = Relay::with_provider(
            RelaySettings {
                timeout: Duration::from_millis(50),
                ..RelaySettings::default()
            },
            Some("test-key".to_string()),
            stub.clone() as Arc<dyn Provider>,
        );

        let result = relay
            .handle(&InboundRequest::post(r#"{"prompt":"hola"}"#))
            .await;
        assert!(matches!(result, RelayResult::Failure(RelayError::Timeout(_))));
        assert_eq!(result.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_identical_requests_yield_identical_envelopes() {
        let stub = StubProvider::new(Behavior::Reply("respuesta fija"));
        let relay = relay(Transport::Post, &stub);
        let request = InboundRequest::post(r#"{"prompt":"Hola mundo"}"#);

        let first = relay.handle(&request).await;
        let second = relay.handle(&request).await;
        assert_eq!(first.status_code(), second.status_code());
        assert_eq!(first.envelope(), second.envelope());
    }

    #[tokio::test]
    async fn test_provider_constructed_once() {
        let connects = Arc::new(AtomicUsize::new(0));
        let stub = StubProvider::new(Behavior::Echo);

        let relay = {
            let connects = Arc::clone(&connects);
            let stub = stub.clone();
            Relay::new(
                RelaySettings::default(),
                Some("test-key".to_string()),
                move |key| {
                    assert_eq!(key, "test-key");
                    connects.fetch_add(1, Ordering::SeqCst);
                    Ok(stub.clone() as Arc<dyn Provider>)
                },
            )
        };

        // 校验失败不会触发构造
        relay.handle(&InboundRequest::post("")).await;
        assert_eq!(connects.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            let result = relay
                .handle(&InboundRequest::post(r#"{"prompt":"hola"}"#))
                .await;
            assert!(result.is_success());
        }
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn test_connector_failure_is_provider_error() {
        let relay = Relay::new(
            RelaySettings::default(),
            Some("test-key".to_string()),
            |_| Err(RelayError::config("no se pudo crear el cliente")),
        );

        let result = relay
            .handle(&InboundRequest::post(r#"{"prompt":"hola"}"#))
            .await;
        assert_eq!(result.outcome(), Outcome::ProviderError);
        assert_eq!(result.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(result
            .envelope()
            .error
            .unwrap()
            .contains("no se pudo crear el cliente"));
    }

    #[tokio::test]
    async fn test_custom_prompt_field() {
        let stub = StubProvider::new(Behavior::Echo);
        let relay = Relay::with_provider(
            RelaySettings {
                prompt_field: "promptMaster".to_string(),
                ..RelaySettings::default()
            },
            Some("test-key".to_string()),
            stub.clone() as Arc<dyn Provider>,
        );

        let result = relay
            .handle(&InboundRequest::post(r#"{"promptMaster":"hola"}"#))
            .await;
        assert_eq!(result.envelope(), Envelope::success("hola"));

        let result = relay
            .handle(&InboundRequest::post(r#"{"prompt":"hola"}"#))
            .await;
        assert!(result
            .envelope()
            .error
            .unwrap()
            .contains("'promptMaster'"));
    }

    #[tokio::test]
    async fn test_concurrent_invocations_are_independent() {
        let stub = StubProvider::new(Behavior::Echo);
        let relay = Arc::new(relay(Transport::Post, &stub));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let relay = Arc::clone(&relay);
                tokio::spawn(async move {
                    let body = serde_json::json!({ "prompt": format!("prompt-{}", i) });
                    (i, relay.handle(&InboundRequest::post(body.to_string())).await)
                })
            })
            .collect();

        for handle in handles {
            let (i, result) = handle.await.unwrap();
            assert_eq!(result.envelope(), Envelope::success(format!("prompt-{}", i)));
        }
        assert_eq!(stub.calls(), 16);
    }

    #[test]
    fn test_reject_prefers_missing_credential() {
        let stub = StubProvider::new(Behavior::Echo);
        let without_key = Relay::with_provider(
            settings(Transport::Post),
            None,
            stub.clone() as Arc<dyn Provider>,
        );
        let result = without_key.reject(RelayError::validation("cuerpo demasiado grande"));
        assert!(matches!(
            result,
            RelayResult::Failure(RelayError::MissingCredential(_))
        ));
        assert_eq!(result.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let with_key = relay(Transport::Post, &stub);
        let result = with_key.reject(RelayError::validation("cuerpo demasiado grande"));
        assert_eq!(result.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            result.envelope(),
            Envelope::error("cuerpo demasiado grande")
        );
        assert_eq!(stub.calls(), 0);
    }

    #[test]
    fn test_extract_prompt_keeps_text_untouched() {
        let stub = StubProvider::new(Behavior::Echo);
        let relay = relay(Transport::Post, &stub);

        let request = relay
            .extract_prompt(&InboundRequest::post(r#"{"prompt":"  hola  ","extra":true}"#))
            .unwrap();
        assert_eq!(request.prompt, "  hola  ");
        assert_eq!(request.method, Method::POST);
    }
}
