pub mod chat_gateway;
pub mod maintenance;

pub use chat_gateway::{ChatGateway, ChatGatewayDependencies, SendOutcome};
pub use maintenance::{MaintenanceConfig, MaintenanceTasks};
