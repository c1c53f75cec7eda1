//! Opaque gRPC server seam.
//!
//! The framework does not link a gRPC stack. Applications wrap theirs in
//! [`GrpcServer`]; modules reach the concrete type through
//! [`GrpcServer::as_any_mut`] to register services.

use std::any::Any;

use async_trait::async_trait;
use tokio::net::TcpListener;

#[async_trait]
pub trait GrpcServer: Send + Sync {
    /// Serves on `listener` until [`GrpcServer::graceful_stop`] is called.
    async fn serve(&self, listener: TcpListener) -> anyhow::Result<()>;

    /// Stops accepting calls and lets running ones finish.
    fn graceful_stop(&self);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
