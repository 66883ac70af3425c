use outbox_domain::error::OutboxError;

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("outbox: {0}")]
    Outbox(#[from] OutboxError),

    #[error("validation: {0}")]
    Validation(String),

    #[error("consumer: {0}")]
    Consumer(String),

    #[error("broker: {0}")]
    Broker(String),
}

impl AppError {
    /// 底层发送失败但记录已落库（补偿扫描会重发）
    pub fn is_pending_resend(&self) -> bool {
        matches!(self, AppError::Outbox(OutboxError::Dispatch { .. }))
    }
}
