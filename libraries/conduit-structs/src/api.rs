//! Every payload exchanged between admin clients, workers, agents, and the
//! broker. JSON with camelCase names; each type embeds the signed
//! [`Envelope`] via flattening, so the wire shape is a single flat object.

use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, Signed};

macro_rules! impl_signed {
    ($($ty:ty),+ $(,)?) => {
        $(impl Signed for $ty {
            fn envelope(&self) -> &Envelope {
                &self.envelope
            }
            fn envelope_mut(&mut self) -> &mut Envelope {
                &mut self.envelope
            }
        })+
    };
}

/// Admin publishes a deployment to an explicit mailbox list and/or a pattern.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PutMessageRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub mailboxes: Vec<String>,
    pub pattern: String,
    pub body: String,
    pub deployment_name: String,
    pub asset: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PutMessageResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub mailboxes: Vec<String>,
    pub deployment_id: String,
    pub message_size: i64,
}

/// Worker long-polls its mailbox.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GetMessageRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub mailbox: String,
}

/// All fields empty means the long poll timed out and the worker should
/// simply poll again.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GetMessageResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub message: String,
    pub body: String,
    pub created_at: String,
    pub receive_count: i64,
    pub deployment: String,
    pub asset: String,
}

impl GetMessageResponse {
    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.body.is_empty()
    }
}

/// Worker acknowledges a processed message.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteMessageRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteMessageResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub message: String,
}

/// A script reports output for the message that carried it.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub message: String,
    pub response: String,
    pub error: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub success: bool,
}

/// List deployments (empty `deployment_id`) or inspect one (set it).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentStatsRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub deployment_id: String,
    pub count: i64,
    pub name_search: String,
    pub key_name_search: String,
    pub get_responses: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentStatsResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub deployments: Vec<DeploymentStats>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentStats {
    pub id: String,
    pub name: String,
    pub deployed_by: String,
    pub created_at: String,
    pub message_count: i64,
    pub pending_count: i64,
    pub response_count: i64,
    pub responses: Vec<DeploymentResponse>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentResponse {
    pub mailbox: String,
    pub response: String,
    pub responded_at: String,
    pub is_error: bool,
}

/// Admin registers a mailbox; the same payload deregisters one.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub mailbox: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub mailbox: String,
    pub access_key_name: String,
    pub access_key_secret: String,
}

/// Multipart metadata for `/upload`: JSON in the `data` field, blob in `file`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadFileRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub filename: String,
    pub md5: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckFileRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub md5: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GetAssetRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub md5: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemStatsResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub total_mailboxes: i64,
    pub message_count: i64,
    pub pending_messages: i64,
    pub connected_clients: i64,
    pub db_version: i64,
    pub file_store_count: i64,
    pub file_store_size: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientStatus {
    pub mailbox: String,
    pub host: String,
    pub version: String,
    pub last_seen_at: String,
    pub online: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientStatusResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub clients: Vec<ClientStatus>,
}

/// A script fragment pushed to a peer worker's agent listener.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub function: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub success: bool,
    pub error: String,
}

impl_signed!(
    PutMessageRequest,
    PutMessageResponse,
    GetMessageRequest,
    GetMessageResponse,
    DeleteMessageRequest,
    DeleteMessageResponse,
    ResponseRequest,
    SimpleRequest,
    SimpleResponse,
    DeploymentStatsRequest,
    DeploymentStatsResponse,
    RegisterRequest,
    RegisterResponse,
    UploadFileRequest,
    CheckFileRequest,
    GetAssetRequest,
    SystemStatsResponse,
    ClientStatusResponse,
    AgentRequest,
    AgentResponse,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_flattens_into_the_payload() {
        let mut req = GetMessageRequest {
            mailbox: "newton.maxwell.bohr".into(),
            ..Default::default()
        };
        req.sign("newton.maxwell.bohr", "sekrit");
        let value = serde_json::to_value(&req).expect("to json");
        assert_eq!(value["mailbox"], "newton.maxwell.bohr");
        assert!(value["keyName"].is_string());
        assert!(value["requestTime"].is_string());
        assert!(value["signature"].is_string());
        assert!(value.get("envelope").is_none());
    }

    #[test]
    fn missing_fields_default() {
        let req: PutMessageRequest =
            serde_json::from_str(r#"{"body":"print(1)"}"#).expect("from json");
        assert_eq!(req.body, "print(1)");
        assert!(req.mailboxes.is_empty());
        assert!(req.pattern.is_empty());
        assert!(req.envelope.token.is_empty());
    }

    #[test]
    fn empty_get_response_signals_timeout() {
        let resp = GetMessageResponse::default();
        assert!(resp.is_empty());
        let full = GetMessageResponse {
            message: "abc".into(),
            body: "print(1)".into(),
            ..Default::default()
        };
        assert!(!full.is_empty());
    }
}
