//! Responder side of the directory protocol.
//!
//! Peer-symmetric request/response pairs: either peer may ask the other for
//! its shared roots (`directory.list`) or one subdirectory by path
//! (`directory.get`). Listings are small and travel as a single control
//! message — never through the chunked transfer path.

use crate::core::protocol::ControlMessage;
use crate::core::provider::FileProvider;
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Answers directory queries from one peer by delegating to the provider.
pub struct DirectoryExchange {
    peer_id: String,
    provider: Arc<dyn FileProvider>,
}

impl DirectoryExchange {
    pub fn new(peer_id: &str, provider: Arc<dyn FileProvider>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            provider,
        }
    }

    /// Answer `directory.list.request` with every shared root.
    pub async fn handle_list_request(&self, request_id: Uuid) -> Result<ControlMessage> {
        let directories = self.provider.list_roots().await?;
        debug!(
            event = "directory_list_served",
            peer = %self.peer_id,
            request_id = %request_id,
            roots = directories.len(),
            "Serving directory list"
        );
        Ok(ControlMessage::DirectoryListResponse {
            request_id,
            directories,
        })
    }

    /// Answer `directory.get.request` for one subdirectory. An unresolvable
    /// path answers with an absent directory rather than failing.
    pub async fn handle_get_request(
        &self,
        request_id: Uuid,
        path: Vec<String>,
    ) -> Result<ControlMessage> {
        let directory = self.provider.read_dir(&path).await?;
        if directory.is_none() {
            debug!(
                event = "directory_get_unresolved",
                peer = %self.peer_id,
                request_id = %request_id,
                ?path,
                "No directory at requested path"
            );
        }
        Ok(ControlMessage::DirectoryGetResponse {
            request_id,
            directory,
        })
    }
}
