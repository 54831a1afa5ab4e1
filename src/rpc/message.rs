//! aria2 JSON-RPC wire format

use super::{Notification, NotificationKind};
use crate::error::{EngineError, Result, RpcErrorKind};
use crate::protocol::{Gid, StatusSnapshot, TransferFile, TransferStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Serialize)]
pub(crate) struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: Vec<Value>,
}

impl<'a> RpcRequest<'a> {
    /// Build a request, prefixing `token:<secret>` when a secret is set
    pub(crate) fn new(id: u64, method: &'a str, secret: Option<&str>, params: Vec<Value>) -> Self {
        let mut all = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = secret {
            all.push(Value::String(format!("token:{}", secret)));
        }
        all.extend(params);
        Self {
            jsonrpc: "2.0",
            id: id.to_string(),
            method,
            params: all,
        }
    }
}

/// Any frame the daemon sends: a response or a notification
#[derive(Debug, Deserialize)]
pub(crate) struct RpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct GidParam {
    gid: String,
}

/// Classified incoming frame
#[derive(Debug)]
pub(crate) enum Incoming {
    Response { id: u64, result: Result<Value> },
    Notification(Notification),
    Ignored(String),
}

impl RpcMessage {
    pub(crate) fn classify(self) -> Incoming {
        if let Some(method) = self.method {
            let Some(kind) = NotificationKind::from_method(&method) else {
                return Incoming::Ignored(format!("unknown notification {}", method));
            };
            let gid = self
                .params
                .and_then(|params| params.into_iter().next())
                .and_then(|param| serde_json::from_value::<GidParam>(param).ok());
            return match gid {
                Some(param) => Incoming::Notification(Notification::new(kind, param.gid)),
                None => Incoming::Ignored(format!("{} without gid", method)),
            };
        }

        let id = match self.id.as_ref().and_then(parse_id) {
            Some(id) => id,
            None => return Incoming::Ignored("response without usable id".to_string()),
        };

        let result = match (self.error, self.result) {
            (Some(err), _) => Err(EngineError::rpc(RpcErrorKind::Remote(err.code), err.message)),
            (None, Some(value)) => Ok(value),
            (None, None) => Err(EngineError::rpc(
                RpcErrorKind::InvalidResponse,
                "Response carries neither result nor error",
            )),
        };
        Incoming::Response { id, result }
    }
}

fn parse_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Decode a call result into a typed value
pub(crate) fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        EngineError::rpc(
            RpcErrorKind::InvalidResponse,
            format!("Unexpected {} result: {}", method, e),
        )
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawVersion {
    pub(crate) version: String,
}

fn zero() -> String {
    "0".to_string()
}

/// `tellStatus` result as aria2 sends it: numbers are decimal strings
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawStatus {
    gid: String,
    status: String,
    #[serde(default = "zero")]
    total_length: String,
    #[serde(default = "zero")]
    completed_length: String,
    #[serde(default = "zero")]
    connections: String,
    #[serde(default = "zero")]
    download_speed: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    files: Vec<RawFile>,
    #[serde(default)]
    followed_by: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFile {
    #[serde(default = "zero")]
    index: String,
    #[serde(default)]
    path: String,
    #[serde(default = "zero")]
    length: String,
    #[serde(default = "zero")]
    completed_length: String,
    #[serde(default)]
    selected: Option<String>,
}

fn number<T: FromStr>(field: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        EngineError::rpc(
            RpcErrorKind::InvalidResponse,
            format!("Field '{}' is not a number: {:?}", field, value),
        )
    })
}

impl TryFrom<RawStatus> for StatusSnapshot {
    type Error = EngineError;

    fn try_from(raw: RawStatus) -> Result<Self> {
        let status = TransferStatus::from_str(&raw.status)
            .map_err(|e| EngineError::rpc(RpcErrorKind::InvalidResponse, e))?;

        let files = raw
            .files
            .into_iter()
            .map(|f| {
                Ok(TransferFile {
                    index: number("index", &f.index)?,
                    path: PathBuf::from(f.path),
                    length: number("length", &f.length)?,
                    completed_length: number("completedLength", &f.completed_length)?,
                    selected: f.selected.as_deref() != Some("false"),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StatusSnapshot {
            gid: Gid::new(raw.gid),
            status,
            completed_length: number("completedLength", &raw.completed_length)?,
            total_length: number("totalLength", &raw.total_length)?,
            connections: number("connections", &raw.connections)?,
            download_speed: number("downloadSpeed", &raw.download_speed)?,
            error_code: raw.error_code,
            error_message: raw.error_message,
            files,
            followed_by: raw.followed_by.into_iter().map(Gid::new).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_carries_token_first() {
        let req = RpcRequest::new(7, "aria2.tellStatus", Some("s3cret"), vec![json!("abc")]);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], "7");
        assert_eq!(value["params"], json!(["token:s3cret", "abc"]));
    }

    #[test]
    fn request_without_secret_has_plain_params() {
        let req = RpcRequest::new(1, "aria2.getVersion", None, vec![]);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["params"], json!([]));
    }

    #[test]
    fn classifies_notification() {
        let msg: RpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "aria2.onBtDownloadComplete",
            "params": [{ "gid": "2089b05ecca3d829" }]
        }))
        .unwrap();
        match msg.classify() {
            Incoming::Notification(n) => {
                assert_eq!(n.kind, NotificationKind::BtDownloadComplete);
                assert_eq!(n.gid.as_str(), "2089b05ecca3d829");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn classifies_error_response() {
        let msg: RpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "3",
            "error": { "code": 1, "message": "Unauthorized" }
        }))
        .unwrap();
        match msg.classify() {
            Incoming::Response { id, result } => {
                assert_eq!(id, 3);
                match result {
                    Err(EngineError::Rpc { kind, message, .. }) => {
                        assert_eq!(kind, RpcErrorKind::Remote(1));
                        assert_eq!(message, "Unauthorized");
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_metadata_status() {
        let raw: RawStatus = serde_json::from_value(json!({
            "gid": "2089b05ecca3d829",
            "status": "complete",
            "totalLength": "34896",
            "completedLength": "34896",
            "connections": "0",
            "downloadSpeed": "0",
            "errorCode": "0",
            "followedBy": ["d2a8a0cfd2dd1c62", "3f0d4cf2a1b5e6c7"],
            "files": [{
                "index": "1",
                "path": "[METADATA]ubuntu.iso",
                "length": "34896",
                "completedLength": "34896",
                "selected": "true",
                "uris": []
            }]
        }))
        .unwrap();
        let snapshot = StatusSnapshot::try_from(raw).unwrap();
        assert_eq!(snapshot.status, TransferStatus::Complete);
        assert_eq!(snapshot.total_length, 34896);
        assert_eq!(snapshot.followed_by.len(), 2);
        assert_eq!(snapshot.files[0].index, 1);
        assert!(snapshot.files[0].selected);
    }

    #[test]
    fn rejects_malformed_numbers() {
        let raw: RawStatus = serde_json::from_value(json!({
            "gid": "a",
            "status": "active",
            "completedLength": "lots"
        }))
        .unwrap();
        let err = StatusSnapshot::try_from(raw).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Rpc {
                kind: RpcErrorKind::InvalidResponse,
                ..
            }
        ));
    }

    #[test]
    fn missing_counters_default_to_zero() {
        let raw: RawStatus =
            serde_json::from_value(json!({ "gid": "a", "status": "waiting" })).unwrap();
        let snapshot = StatusSnapshot::try_from(raw).unwrap();
        assert_eq!(snapshot.completed_length, 0);
        assert_eq!(snapshot.connections, 0);
        assert!(snapshot.followed_by.is_empty());
    }
}
