//! Image pulls through the CRI image service on the runtime's unix socket.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use k8s_cri::v1::image_service_client::ImageServiceClient;
use k8s_cri::v1::{ImageSpec, PullImageRequest};
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::error::{KbuError, Result};
use crate::runtime::ImagePuller;

pub struct CriImagePuller {
    socket: PathBuf,
}

impl CriImagePuller {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }
}

/// gRPC channel over a unix socket. The endpoint URI is a placeholder; every
/// connection goes to `socket`.
async fn connect(socket: &Path) -> Result<Channel> {
    let socket = socket.to_path_buf();
    let display = socket.display().to_string();
    Endpoint::try_from("http://[::]:50051")
        .map_err(|e| KbuError::Pull(display.clone(), e.to_string()))?
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move {
                let stream = UnixStream::connect(socket).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(|e| KbuError::Pull(display, format!("failed to connect to runtime: {e}")))
}

#[async_trait]
impl ImagePuller for CriImagePuller {
    async fn pull_image(&self, reference: &str) -> Result<String> {
        let channel = connect(&self.socket).await?;
        let mut client = ImageServiceClient::new(channel);
        let request = PullImageRequest {
            image: Some(ImageSpec {
                image: reference.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let response = client
            .pull_image(request)
            .await
            .map_err(|status| KbuError::Pull(reference.to_string(), status.message().to_string()))?;
        Ok(response.into_inner().image_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_socket_is_a_pull_error() {
        let dir = tempfile::tempdir().unwrap();
        let puller = CriImagePuller::new(dir.path().join("crio.sock"));
        let err = puller.pull_image("quay.io/a/b:1").await.unwrap_err();
        assert!(matches!(err, KbuError::Pull(_, _)));
    }
}
