pub mod monitor;


pub use monitor::{RecoveryConfig, RecoveryReport, StuckTaskRecovery};
