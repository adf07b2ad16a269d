//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志：RUST_LOG 优先，未设置时本 crate 取 debug、其余取 info
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mantis=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
