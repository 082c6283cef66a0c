use std::sync::Arc;

use application::{ChatGateway, Clock};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ChatGateway>,
    /// 传输层直接回写的信封（格式错误等）用它打时间戳
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(gateway: Arc<ChatGateway>, clock: Arc<dyn Clock>) -> Self {
        Self { gateway, clock }
    }
}
