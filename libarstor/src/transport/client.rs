//! Typed QUIC client for driving an ArStor plugin.
//!
//! Each method sends one request on its own bi-stream and checks that the
//! reply is the variant that request answers with. A reply of another kind
//! is reported as [`CsiError::TransportError`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use crate::error::CsiError;
use crate::message::CsiMessage;
use crate::types::*;

/// Upper bound on a single reply; volume and snapshot listings are the large ones.
const MAX_REPLY_BYTES: usize = 16 * 1024 * 1024;

/// Pulls the expected payload out of a reply or names the mismatch.
macro_rules! expect_reply {
    ($reply:expr, $variant:pat => $value:expr) => {
        match $reply {
            $variant => Ok($value),
            other => Err(CsiError::TransportError(format!("unexpected reply {other}"))),
        }
    };
}

/// Connection to one plugin endpoint.
pub struct ArStorClient {
    connection: quinn::Connection,
}

impl ArStorClient {
    /// Connect to the plugin at `addr`, verifying its certificate against
    /// `server_name`.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let crypto = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("TLS config unusable for QUIC: {e}")))?;
        let mut endpoint = quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
            .map_err(CsiError::transport)?;
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?
            .await
            .map_err(CsiError::transport)?;
        debug!(%addr, %server_name, "connected to plugin");
        Ok(Self { connection })
    }

    /// Raw exchange: whatever the plugin replies, including
    /// [`CsiMessage::Error`], comes back as `Ok`.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(CsiError::transport)?;

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;

        let buf = recv
            .read_to_end(MAX_REPLY_BYTES)
            .await
            .map_err(CsiError::transport)?;
        let reply: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%reply, "plugin replied");
        Ok(reply)
    }

    /// Like [`request`](Self::request) but a [`CsiMessage::Error`] reply
    /// becomes `Err`.
    pub async fn call(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        match self.request(msg).await? {
            CsiMessage::Error(e) => Err(e),
            other => Ok(other),
        }
    }

    async fn call_ok(&self, msg: &CsiMessage) -> Result<(), CsiError> {
        expect_reply!(self.call(msg).await?, CsiMessage::Ok => ())
    }

    // ----- Identity --------------------------------------------------------

    pub async fn probe(&self) -> Result<bool, CsiError> {
        expect_reply!(self.call(&CsiMessage::Probe).await?, CsiMessage::ProbeResult(ready) => ready)
    }

    pub async fn plugin_info(&self) -> Result<PluginInfo, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::GetPluginInfo).await?,
            CsiMessage::PluginInfoResponse(info) => info
        )
    }

    pub async fn plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::GetPluginCapabilities).await?,
            CsiMessage::PluginCapabilitiesResponse(caps) => caps
        )
    }

    // ----- Controller ------------------------------------------------------

    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::CreateVolume(req)).await?,
            CsiMessage::VolumeCreated(volume) => volume
        )
    }

    /// Deleting an unknown volume succeeds.
    pub async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.call_ok(&CsiMessage::DeleteVolume(volume_id.clone()))
            .await
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::ListVolumes).await?,
            CsiMessage::VolumeList(volumes) => volumes
        )
    }

    pub async fn capacity(&self) -> Result<u64, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::GetCapacity).await?,
            CsiMessage::Capacity(bytes) => bytes
        )
    }

    pub async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: Vec<VolumeCapability>,
    ) -> Result<bool, CsiError> {
        let msg = CsiMessage::ValidateVolumeCapabilities {
            volume_id: volume_id.clone(),
            capabilities,
        };
        expect_reply!(self.call(&msg).await?, CsiMessage::CapabilitiesValid(valid) => valid)
    }

    pub async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::ControllerPublishVolume(req)).await?,
            CsiMessage::PublishContext(context) => context
        )
    }

    pub async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError> {
        self.call_ok(&CsiMessage::ControllerUnpublishVolume {
            volume_id: volume_id.clone(),
            node_id: node_id.to_owned(),
        })
        .await
    }

    pub async fn expand_volume(
        &self,
        req: ExpandVolumeRequest,
    ) -> Result<ExpandVolumeResponse, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::ExpandVolume(req)).await?,
            CsiMessage::VolumeExpanded(resp) => resp
        )
    }

    pub async fn controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::GetControllerCapabilities).await?,
            CsiMessage::ControllerCapabilitiesResponse(caps) => caps
        )
    }

    pub async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::CreateSnapshot(req)).await?,
            CsiMessage::SnapshotCreated(snapshot) => snapshot
        )
    }

    pub async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        self.call_ok(&CsiMessage::DeleteSnapshot(snapshot_id.clone()))
            .await
    }

    pub async fn list_snapshots(&self, req: ListSnapshotsRequest) -> Result<Vec<Snapshot>, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::ListSnapshots(req)).await?,
            CsiMessage::SnapshotList(snapshots) => snapshots
        )
    }

    // ----- Node ------------------------------------------------------------

    pub async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.call_ok(&CsiMessage::StageVolume(req)).await
    }

    pub async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.call_ok(&CsiMessage::UnstageVolume {
            volume_id: volume_id.clone(),
            staging_target_path: staging_target_path.to_owned(),
        })
        .await
    }

    pub async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.call_ok(&CsiMessage::PublishVolume(req)).await
    }

    pub async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        self.call_ok(&CsiMessage::UnpublishVolume {
            volume_id: volume_id.clone(),
            target_path: target_path.to_owned(),
        })
        .await
    }

    pub async fn node_expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<(), CsiError> {
        self.call_ok(&CsiMessage::NodeExpandVolume(req)).await
    }

    pub async fn node_info(&self) -> Result<NodeInfo, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::GetNodeInfo).await?,
            CsiMessage::NodeInfoResponse(info) => info
        )
    }

    pub async fn node_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        expect_reply!(
            self.call(&CsiMessage::GetNodeCapabilities).await?,
            CsiMessage::NodeCapabilitiesResponse(caps) => caps
        )
    }

    pub fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_flag(reply: CsiMessage) -> Result<bool, CsiError> {
        expect_reply!(reply, CsiMessage::ProbeResult(ready) => ready)
    }

    #[test]
    fn mismatched_reply_is_a_transport_error() {
        assert!(ready_flag(CsiMessage::ProbeResult(true)).unwrap());
        let err = ready_flag(CsiMessage::Capacity(7)).unwrap_err();
        assert!(matches!(err, CsiError::TransportError(ref m) if m.contains("Capacity")));
    }
}
