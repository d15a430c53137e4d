use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("YAML 解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("JSON 解析错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Error de red con el proveedor: {0}")]
    HttpError(#[from] reqwest::Error),

    /// 服务端缺少提供商凭据，每个请求都会失败
    #[error("Servidor mal configurado: falta la credencial del proveedor ({0})")]
    MissingCredential(String),

    /// 调用方需要修正请求
    #[error("{0}")]
    Validation(String),

    #[error("Error del proveedor ({status}): {message}")]
    UpstreamError { status: u16, message: String },

    #[error("Respuesta del proveedor no válida: {0}")]
    MalformedResponse(String),

    #[error("El proveedor no respondió en {0:?}")]
    Timeout(Duration),

    #[error("Error del proveedor: {0}")]
    Provider(String),

    #[error("内部错误: {0}")]
    InternalError(String),
}

/// 错误分类，决定响应状态码和指标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Provider,
}

impl RelayError {
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::ConfigError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RelayError::InternalError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        RelayError::Validation(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        RelayError::Provider(msg.into())
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        RelayError::UpstreamError {
            status,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::ConfigError(_)
            | RelayError::IoError(_)
            | RelayError::YamlError(_)
            | RelayError::MissingCredential(_) => ErrorKind::Configuration,
            RelayError::Validation(_) | RelayError::JsonError(_) => ErrorKind::Validation,
            RelayError::HttpError(_)
            | RelayError::UpstreamError { .. }
            | RelayError::MalformedResponse(_)
            | RelayError::Timeout(_)
            | RelayError::Provider(_)
            | RelayError::InternalError(_) => ErrorKind::Provider,
        }
    }

    /// 上游状态码不会透传，提供商失败一律为 500
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Configuration | ErrorKind::Provider => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
