pub mod audit;
pub mod ses;
pub mod threat;
pub mod utils;

pub use audit::{AuditConfig, AuditManager};
pub use ses::SessionManager;
pub use threat::SecurityMonitor;
