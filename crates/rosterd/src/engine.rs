use std::time::Duration;

use roster_core::{EncodeError, Embedding, FaceEncoder};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Pending encode requests before senders start waiting.
const ENGINE_QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("image encoding timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Encode {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, EncodeError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Encode one uploaded image. The buffer moves to the engine thread and is
    /// dropped there once the embedding is extracted.
    pub async fn encode(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        let request = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(EngineRequest::Encode { image, reply: reply_tx })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            let embedding = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
            Ok::<_, EngineError>(embedding)
        };

        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
    }
}

/// Spawn the encoder on a dedicated OS thread.
///
/// ONNX sessions are not shared across threads; every encode is serialized
/// through this one owner.
pub fn spawn_engine<E>(mut encoder: E, timeout: Duration) -> Result<EngineHandle, EngineError>
where
    E: FaceEncoder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(ENGINE_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("roster-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Encode { image, reply } => {
                        if reply.is_closed() {
                            tracing::debug!("encode request abandoned before start");
                            continue;
                        }
                        let started = std::time::Instant::now();
                        let result = encoder.encode(&image);
                        drop(image);
                        match &result {
                            Ok(e) => tracing::debug!(dim = e.dim(), elapsed = ?started.elapsed(), "image encoded"),
                            Err(err) => tracing::info!(error = %err, elapsed = ?started.elapsed(), "image not encoded"),
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, timeout })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoEncoder;

    impl FaceEncoder for EchoEncoder {
        fn encode(&mut self, image: &[u8]) -> Result<Embedding, EncodeError> {
            match image {
                b"" => Err(EncodeError::NoFaceDetected),
                b"slow" => {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(Embedding::new(vec![0.0]))
                }
                bytes => Ok(Embedding::new(bytes.iter().map(|&b| b as f32).collect())),
            }
        }
    }

    #[tokio::test]
    async fn test_encode_roundtrip_through_thread() {
        let engine = spawn_engine(EchoEncoder, Duration::from_secs(2)).unwrap();
        let e = engine.encode(vec![1, 2, 3]).await.unwrap();
        assert_eq!(e.values, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_encode_error_propagates() {
        let engine = spawn_engine(EchoEncoder, Duration::from_secs(2)).unwrap();
        let err = engine.encode(Vec::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Encode(EncodeError::NoFaceDetected)));
    }

    #[tokio::test]
    async fn test_encode_timeout() {
        let engine = spawn_engine(EchoEncoder, Duration::from_millis(50)).unwrap();
        let err = engine.encode(b"slow".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }
}
