use super::{effective_config, ProxyArgs};
use anyhow::Context;
use hotswap_core::{AuditLog, Proxy};
use std::path::Path;
use std::time::Duration;

pub fn run(config_path: Option<&Path>, args: &ProxyArgs) -> anyhow::Result<()> {
    let config = effective_config(config_path, args)?;
    config.validate()?;

    let audit_path = config.audit_log_path();
    let audit = AuditLog::open(&audit_path)
        .with_context(|| format!("opening audit log {}", audit_path.display()))?;
    tracing::info!(
        session = audit.session(),
        audit_log = %audit_path.display(),
        command = %config.worker.command,
        "starting proxy"
    );

    let proxy = Proxy::new(config, audit)?;
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(proxy.run(tokio::io::stdin(), tokio::io::stdout()));

    // A stdin read may still be parked on the blocking pool after a fatal
    // error; don't wait for the client to close it.
    rt.shutdown_timeout(Duration::from_millis(100));

    result.context("proxy stopped")
}
