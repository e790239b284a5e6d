//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::guardian::v1::admission_service_server::AdmissionServiceServer;
use super::service::AdmissionServiceImpl;
use crate::error::{GuardianError, Result};
use crate::quota::AdmissionGate;

/// gRPC server for the admission service.
pub struct GrpcServer<G: AdmissionGate + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission gate instance
    gate: Arc<G>,
}

impl<G: AdmissionGate + 'static> GrpcServer<G> {
    /// Create a new gRPC server.
    pub fn new(addr: SocketAddr, gate: Arc<G>) -> Self {
        Self { addr, gate }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = AdmissionServiceImpl::new(self.gate);

        info!(
            addr = %self.addr,
            "Starting gRPC server for AdmissionService with graceful shutdown"
        );

        Server::builder()
            .add_service(AdmissionServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                GuardianError::Grpc(e)
            })
    }

    /// Serve on an already bound listener, ignoring the configured address.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let local_addr = listener.local_addr()?;
        let service = AdmissionServiceImpl::new(self.gate);

        info!(addr = %local_addr, "Starting gRPC server for AdmissionService");

        Server::builder()
            .add_service(AdmissionServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                GuardianError::Grpc(e)
            })
    }
}
