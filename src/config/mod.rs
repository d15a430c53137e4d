use crate::error::RelayError;
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// 服务器内置路由，中继端点不能占用
pub const RESERVED_ROUTES: [&str; 2] = ["/health", "/metrics"];

/// 提示词的传输方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// `GET /api?prompt=...`
    Get,
    /// `POST /api {"prompt": "..."}`
    #[default]
    Post,
}

/// 主配置结构
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_route")]
    pub route: String,
    #[serde(default = "default_prompt_field")]
    pub prompt_field: String,
    #[serde(default = "default_true")]
    pub cors: bool,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// 文本生成提供商配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// 保存凭据的环境变量名，凭据本身不写进配置文件
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_route() -> String {
    "/api".to_string()
}

fn default_prompt_field() -> String {
    "prompt".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key_env: default_api_key_env(),
            api_base: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            route: default_route(),
            prompt_field: default_prompt_field(),
            cors: default_true(),
            max_body_bytes: default_max_body_bytes(),
            provider: ProviderConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// 从环境变量读取凭据；空值视为缺失
    pub fn resolve_credential(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

impl Config {
    /// 从 YAML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let content = Self::replace_env_vars(content)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 替换配置中的环境变量 ${VAR}
    fn replace_env_vars(content: &str) -> Result<String> {
        static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid")
        });

        let mut result = content.to_string();
        for cap in ENV_VAR.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| RelayError::config(format!("环境变量未找到: {}", var_name)))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if !self.route.starts_with('/') {
            return Err(RelayError::config(format!(
                "route 必须以 '/' 开头: {}",
                self.route
            )));
        }
        if RESERVED_ROUTES.contains(&self.route.as_str()) {
            return Err(RelayError::config(format!(
                "route 不能使用内置路由: {}",
                self.route
            )));
        }
        if self.prompt_field.trim().is_empty() {
            return Err(RelayError::config("prompt_field 不能为空"));
        }
        if self.max_body_bytes == 0 {
            return Err(RelayError::config("max_body_bytes 必须大于 0"));
        }
        if self.provider.model.trim().is_empty() {
            return Err(RelayError::config("provider.model 不能为空"));
        }
        if self.provider.api_key_env.is_empty() {
            return Err(RelayError::config("provider.api_key_env 不能为空"));
        }
        if self.provider.timeout_secs == 0 {
            return Err(RelayError::config("provider.timeout_secs 必须大于 0"));
        }

        Ok(())
    }
}
