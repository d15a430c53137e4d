pub mod gemini;

use crate::Result;
use async_trait::async_trait;

/// 单次文本生成能力，所有 provider 必须实现
///
/// 实现在构造后只读，可以在并发请求之间共享。
#[async_trait]
pub trait Provider: Send + Sync {
    /// 用指定模型生成文本，不支持流式
    async fn generate(&self, model: &str, prompt: &str) -> Result<String>;
}
