use hyper::body::Bytes;
use hyper::Method;
use serde::{Deserialize, Serialize};

/// 入站请求的适配视图：方法、原始查询串和完整请求体
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub query: Option<String>,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn new(method: Method, query: Option<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            query,
            body: body.into(),
        }
    }

    /// 创建带查询串的 GET 请求
    pub fn get(query: impl Into<String>) -> Self {
        Self::new(Method::GET, Some(query.into()), Bytes::new())
    }

    /// 创建带请求体的 POST 请求
    pub fn post(body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, None, body)
    }
}

/// 通过校验的提示词请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub prompt: String,
    pub method: Method,
}

/// 返回给调用方的统一响应体
///
/// `data` 与 `error` 恰好有一个存在，只应通过 [`Envelope::success`]
/// 和 [`Envelope::error`] 构造。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn success(data: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
