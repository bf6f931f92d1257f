use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::{Method, Uri};
use axum::response::Response;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::response::ResponseSink;
use crate::config::AppConfig;
use crate::pipeline::coordinator::PipelineOrchestrator;
use crate::pipeline::filter::{LineBufferedRecordFilter, RecordPredicate};
use crate::pipeline::sink::ChunkSink;
use crate::pipeline::source::FileSource;
use crate::pipeline::stage::PipelineStage;

/// Time open connections get to finish once shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct ServerState {
    config: Arc<AppConfig>,
    shutdown: CancellationToken,
}

/// Every path streams the filtered source; each request gets its own pipeline
pub fn create_router(config: Arc<AppConfig>, shutdown: CancellationToken) -> Router {
    Router::new()
        .fallback(stream_records)
        .with_state(ServerState { config, shutdown })
}

/// Source file → record filter → streaming response
async fn stream_records(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
) -> Response {
    debug!("StreamServer: {} {}", method, uri);
    let config = Arc::clone(&state.config);
    let (mut sink, pending) = ResponseSink::new(config.sink.clone());

    match FileSource::open(&config.source.path, config.source.chunk_size).await {
        Ok(source) => {
            let filter = LineBufferedRecordFilter::new(RecordPredicate::from(&config.filter));
            let orchestrator = PipelineOrchestrator::new(config.pipeline_config())
                .with_parent(&state.shutdown)
                .observe_filter(filter.counters());
            let stages: Vec<Box<dyn PipelineStage>> = vec![Box::new(filter)];

            let handle = orchestrator.connect(source, stages, sink);
            tokio::spawn(async move {
                match handle.wait().await {
                    Ok(report) => info!(
                        "StreamServer: {} done ({}). {}",
                        uri, report.state, report.health
                    ),
                    Err(e) => warn!("StreamServer: {}: {}", uri, e),
                }
            });
        }
        Err(e) => {
            warn!("StreamServer: opening source: {}", e);
            sink.abort(&e).await;
        }
    }

    pending.resolve().await
}

/// Streams the filtered source file to every client
pub struct StreamServer {
    listener: TcpListener,
    config: Arc<AppConfig>,
    shutdown: CancellationToken,
}

impl StreamServer {
    pub async fn bind(config: AppConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.server.listen)
            .await
            .with_context(|| format!("binding {}", config.server.listen))?;
        Ok(StreamServer {
            listener,
            config: Arc::new(config),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the shutdown token fires
    pub async fn run(self) -> anyhow::Result<()> {
        info!("StreamServer: listening on {}", self.local_addr()?);
        let router = create_router(Arc::clone(&self.config), self.shutdown.clone());
        let header_timeout = self.config.server.header_timeout();

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("StreamServer: accept failed: {}", e);
                    continue;
                }
            };

            let router = router.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, router, header_timeout, shutdown).await {
                    debug!("StreamServer: {}: {}", peer, e);
                }
            });
        }

        info!("StreamServer: stopped");
        Ok(())
    }
}

/// Drive one HTTP/1.1 connection until it closes or shutdown runs out of grace
async fn serve_connection(
    stream: TcpStream,
    router: Router,
    header_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout)
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            match tokio::time::timeout(SHUTDOWN_GRACE, conn.as_mut()).await {
                Ok(result) => result,
                // dropping the connection closes the socket
                Err(_) => Ok(()),
            }
        }
    }
}
