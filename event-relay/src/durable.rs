//! Writes whose failures are reported rather than deferred.
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Writes `bytes` and flushes them out of the writer's buffer.
///
/// `tokio::fs::File` acknowledges a write once it sits in the file's buffer and
/// only reports the outcome of the real write on a later flush; `sync_data` and
/// `sync_all` do not surface it. Every write that must be on disk before it is
/// acknowledged goes through here before syncing.
pub(crate) async fn write_flushed<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}
