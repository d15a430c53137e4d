use crate::error::ErrorKind;
use crate::relay::RelayResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 按结果分类的请求计数
#[derive(Debug, Default)]
pub struct Metrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    validation_errors: AtomicU64,
    configuration_errors: AtomicU64,
    provider_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &RelayResult) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            RelayResult::Success(_) => &self.successful_requests,
            RelayResult::Failure(e) => match e.kind() {
                ErrorKind::Validation => &self.validation_errors,
                ErrorKind::Configuration => &self.configuration_errors,
                ErrorKind::Provider => &self.provider_errors,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 导出 Prometheus 格式
    pub fn export_prometheus(&self) -> String {
        format!(
            "# HELP promptrelay_requests_total Total number of relay requests\n\
             # TYPE promptrelay_requests_total counter\n\
             promptrelay_requests_total {}\n\
             # HELP promptrelay_requests_successful Relay requests answered by the provider\n\
             # TYPE promptrelay_requests_successful counter\n\
             promptrelay_requests_successful {}\n\
             # HELP promptrelay_validation_errors Requests rejected before the provider call\n\
             # TYPE promptrelay_validation_errors counter\n\
             promptrelay_validation_errors {}\n\
             # HELP promptrelay_configuration_errors Requests failed by missing server configuration\n\
             # TYPE promptrelay_configuration_errors counter\n\
             promptrelay_configuration_errors {}\n\
             # HELP promptrelay_provider_errors Provider calls that failed\n\
             # TYPE promptrelay_provider_errors counter\n\
             promptrelay_provider_errors {}\n",
            self.total_requests.load(Ordering::Relaxed),
            self.successful_requests.load(Ordering::Relaxed),
            self.validation_errors.load(Ordering::Relaxed),
            self.configuration_errors.load(Ordering::Relaxed),
            self.provider_errors.load(Ordering::Relaxed)
        )
    }
}

/// 获取全局指标实例
pub fn global_metrics() -> &'static Arc<Metrics> {
    use once_cell::sync::Lazy;
    static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| Arc::new(Metrics::new()));
    &METRICS
}
