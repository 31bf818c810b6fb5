//! Connection pool collaborator interface

use async_trait::async_trait;

/// The transport connection pool, consumed by the client lifecycle only to
/// tear connections down on shutdown.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Close every pooled connection
    async fn close_all(&self);
}
