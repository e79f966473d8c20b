//! The lifecycle orchestrator (§4.8): wires an accepted connection to a
//! multiplexer and guarantees teardown runs regardless of how the
//! connection ends.

use std::sync::Arc;

use tracing::info;
use tracing::warn;

use crate::error::AgenticaError;
use crate::error::Result;
use crate::multiplexer::Multiplexer;
use crate::notifier::SharedNotifier;
use crate::registry::Registry;
use crate::transport::DEFAULT_WRITER_CAPACITY;
use crate::transport::Transport;
use crate::transport::spawn_writer;

/// Drive one accepted connection to completion (§4.8 steps 1-6). Clients
/// must call `registry.register_session(cid)` before this is invoked.
pub async fn serve_connection(
    cid: String,
    transport: Arc<dyn Transport>,
    registry: Registry,
    notifier: SharedNotifier,
) -> Result<()> {
    if !registry.session_registered(&cid) {
        return Err(AgenticaError::Validation(format!(
            "cid {cid} must be registered before a socket is accepted"
        )));
    }

    let (server_tx, writer_handle) = spawn_writer(transport.clone(), DEFAULT_WRITER_CAPACITY);
    let multiplexer = Multiplexer::new(registry.clone(), server_tx, notifier);

    let run_result = read_loop(&transport, &multiplexer).await;

    // Unconditional teardown regardless of how the read loop ended.
    multiplexer.shutdown().await;
    transport.close().await;
    if let Err(e) = writer_handle.await {
        warn!(error = %e, "writer task panicked during shutdown");
    }
    registry.deregister_session(&cid);
    info!(cid, "connection teardown complete");

    run_result
}

async fn read_loop(transport: &Arc<dyn Transport>, multiplexer: &Multiplexer) -> Result<()> {
    loop {
        match transport.recv_bytes().await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(msg) => multiplexer.handle_client_message(msg).await,
                Err(e) => warn!(error = %e, "dropping malformed client frame"),
            },
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::ServerConfig;
    use crate::transport::test_support::MemoryTransport;

    #[tokio::test]
    async fn serve_connection_requires_prior_registration() {
        let registry = Registry::new(ServerConfig::default(), crate::notifier::tracing_notifier());
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(Vec::new()));
        let err = serve_connection("never-registered".into(), transport, registry, crate::notifier::tracing_notifier())
            .await
            .unwrap_err();
        assert!(matches!(err, AgenticaError::Validation(_)));
    }

    #[tokio::test]
    async fn serve_connection_deregisters_the_session_on_stream_end() {
        let registry = Registry::new(ServerConfig::default(), crate::notifier::tracing_notifier());
        registry.register_session("c1");
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(Vec::new()));
        serve_connection("c1".into(), transport, registry.clone(), crate::notifier::tracing_notifier())
            .await
            .expect("clean shutdown");
        assert!(!registry.session_registered("c1"));
    }
}
