use crate::client::{Client, ClientError};
use crate::request::RequestError;
use log::{debug, info};
use peerlink_core::frame::Method;
use serde_json::json;

pub const GROUPS_PATH: &str = "/v1/groups/";

impl Client {
    pub async fn join_group(&self, group_id: &str) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.send_request(Method::Post, GROUPS_PATH, json!({ "groups": [group_id] }))
            .await?;
        info!(target: "Client/Groups", "Joined group {group_id}");
        self.groups.lock().await.insert(group_id.to_string());
        Ok(())
    }

    pub async fn leave_group(&self, group_id: &str) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.send_request(Method::Delete, GROUPS_PATH, json!({ "groups": [group_id] }))
            .await?;
        info!(target: "Client/Groups", "Left group {group_id}");
        self.groups.lock().await.remove(group_id);
        Ok(())
    }

    /// Groups joined on this client, in name order.
    pub async fn joined_groups(&self) -> Vec<String> {
        self.groups.lock().await.iter().cloned().collect()
    }

    /// Joins every recorded group again in a single request. Returns how many
    /// were re-joined.
    pub(crate) async fn rejoin_groups(&self) -> Result<usize, RequestError> {
        let groups = self.joined_groups().await;
        if groups.is_empty() {
            return Ok(0);
        }
        let count = groups.len();
        debug!(target: "Client/Groups", "Re-joining {count} groups");
        self.send_request(Method::Post, GROUPS_PATH, json!({ "groups": groups }))
            .await?;
        Ok(count)
    }
}
