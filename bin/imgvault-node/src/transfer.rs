//! Node-to-node image transfer
//!
//! Used by the balancer to hand an image to the node that now owns it. The
//! receiving side is the node's HTTP front end:
//!
//! ```text
//! PUT http://{address}:{port}/internal/images/{id}
//! x-image-type:  <type code>
//! x-replication: <replication>
//! x-expire-time: <ms since epoch, -1 = never>
//! content-type:  image MIME type, or application/octet-stream
//! body:          raw payload
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use imgvault_common::{Error, ImageType, Result};
use imgvault_placement::Node;
use std::time::Duration;
use tracing::debug;

pub const HEADER_IMAGE_TYPE: &str = "x-image-type";
pub const HEADER_REPLICATION: &str = "x-replication";
pub const HEADER_EXPIRE_TIME: &str = "x-expire-time";

/// One image to hand over
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub id: i64,
    pub image_type: ImageType,
    pub replication: u8,
    pub expire_time: i64,
    pub payload: Bytes,
}

impl From<crate::store::Image> for TransferRequest {
    fn from(image: crate::store::Image) -> Self {
        Self {
            id: image.id,
            image_type: image.image_type,
            replication: image.replication,
            expire_time: image.expire_time,
            payload: image.payload,
        }
    }
}

/// Sends images to other nodes
#[async_trait]
pub trait RemoteTransfer: Send + Sync {
    /// Deliver `request` to `node`; success means the node stored it
    async fn send(&self, node: &Node, request: &TransferRequest) -> Result<()>;
}

/// [`RemoteTransfer`] over HTTP
pub struct HttpTransfer {
    http_client: reqwest::Client,
}

impl HttpTransfer {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("http client: {e}")))?;
        Ok(Self { http_client })
    }

    #[must_use]
    pub fn url(node: &Node, id: i64) -> String {
        format!("http://{}/internal/images/{id}", node.endpoint())
    }
}

#[async_trait]
impl RemoteTransfer for HttpTransfer {
    async fn send(&self, node: &Node, request: &TransferRequest) -> Result<()> {
        let address = node.endpoint();
        let url = Self::url(node, request.id);
        debug!("transferring image {} to {address}", request.id);

        let response = self
            .http_client
            .put(&url)
            .header(HEADER_IMAGE_TYPE, request.image_type.code().to_string())
            .header(HEADER_REPLICATION, request.replication.to_string())
            .header(HEADER_EXPIRE_TIME, request.expire_time.to_string())
            .header(
                reqwest::header::CONTENT_TYPE,
                request.image_type.mime().unwrap_or("application/octet-stream"),
            )
            .body(request.payload.clone())
            .send()
            .await
            .map_err(|e| Error::Transfer {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transfer {
                address,
                reason: format!("status {status}: {body}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, return its head and body, answer with `status`
    async fn serve_once(listener: TcpListener, status: &'static str) -> (String, Vec<u8>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let head_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
        let content_length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .map_or(0, |v| v.trim().parse().unwrap());
        while buf.len() < head_end + content_length {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        let reply = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        socket.write_all(reply.as_bytes()).await.unwrap();
        (head, buf[head_end..head_end + content_length].to_vec())
    }

    fn request() -> TransferRequest {
        TransferRequest {
            id: 42,
            image_type: ImageType::Webp,
            replication: 2,
            expire_time: -1,
            payload: Bytes::from_static(b"webp-data"),
        }
    }

    #[tokio::test]
    async fn test_send_puts_image_with_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, "201 Created"));

        let transfer = HttpTransfer::new(Duration::from_secs(5)).unwrap();
        let node = Node::new(2, "127.0.0.1", port);
        transfer.send(&node, &request()).await.unwrap();

        let (head, body) = server.await.unwrap();
        assert!(head.starts_with("put /internal/images/42 "));
        assert!(head.contains("x-image-type: 4"));
        assert!(head.contains("x-replication: 2"));
        assert!(head.contains("x-expire-time: -1"));
        assert!(head.contains("content-type: image/webp"));
        assert_eq!(body, b"webp-data");
    }

    #[tokio::test]
    async fn test_error_status_is_transfer_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, "500 Internal Server Error"));

        let transfer = HttpTransfer::new(Duration::from_secs(5)).unwrap();
        let node = Node::new(2, "127.0.0.1", port);
        let err = transfer.send(&node, &request()).await.unwrap_err();
        assert!(matches!(err, Error::Transfer { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transfer_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transfer = HttpTransfer::new(Duration::from_secs(1)).unwrap();
        let err = transfer
            .send(&Node::new(2, "127.0.0.1", port), &request())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
