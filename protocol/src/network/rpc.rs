//! # Wire Messages
//!
//! Every connection, client or peer, carries exactly one [`Envelope`] and
//! gets exactly one [`Response`] back. Both are JSON inside a
//! length-prefixed frame (see [`super::wire`]).
//!
//! ## Message Index
//!
//! | Request         | Sent by | Response                         |
//! |-----------------|---------|----------------------------------|
//! | `CreateFile`    | client  | `FileCreated` once confirmed     |
//! | `AppendRecord`  | client  | `RecordAppended` once confirmed  |
//! | `ListFiles`     | client  | `Files`                          |
//! | `TotalRecords`  | client  | `TotalRecords`                   |
//! | `ReadRecord`    | client  | `Record`                         |
//! | `Block`         | peer    | `BlockAccepted`                  |
//! | `StoreAndStop`  | client  | `Stored`, then the miner exits   |
//!
//! Any request may instead get `Error { message }`. The node keeps running.

use serde::{Deserialize, Serialize};

use crate::storage::block::Block;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    CreateFile { filename: String },
    AppendRecord { filename: String, record: Vec<u8> },
    ListFiles,
    TotalRecords { filename: String },
    ReadRecord { filename: String, index: u64 },
    Block { block: Block },
    StoreAndStop,
}

impl Request {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateFile { .. } => "create_file",
            Self::AppendRecord { .. } => "append_record",
            Self::ListFiles => "list_files",
            Self::TotalRecords { .. } => "total_records",
            Self::ReadRecord { .. } => "read_record",
            Self::Block { .. } => "block",
            Self::StoreAndStop => "store_and_stop",
        }
    }
}

/// A request plus the sender's listening address. Peers fill `origin` so
/// the receiver does not flood a block straight back; clients leave it
/// empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub request: Request,
}

impl Envelope {
    pub fn client(request: Request) -> Self {
        Self {
            origin: None,
            request,
        }
    }

    pub fn from_peer(origin: impl Into<String>, request: Request) -> Self {
        Self {
            origin: Some(origin.into()),
            request,
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    FileCreated { block_hash: String },
    RecordAppended { index: u64, block_hash: String },
    Files { files: Vec<String> },
    TotalRecords { count: u64 },
    Record { record: Vec<u8> },
    BlockAccepted { known: bool },
    Stored { blocks: usize },
    Error { message: String },
}

impl Response {
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let env = Envelope::client(Request::ReadRecord {
            filename: "log".into(),
            index: 3,
        });
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"request": {"type": "read_record", "filename": "log", "index": 3}})
        );
    }

    #[test]
    fn peer_envelope_carries_origin() {
        let env = Envelope::from_peer("10.0.0.2:9740", Request::Block { block: Block::genesis() });
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.request.kind(), "block");
    }

    #[test]
    fn unit_requests_parse_from_bare_tag() {
        let req: Request = serde_json::from_str(r#"{"type":"store_and_stop"}"#).unwrap();
        assert_eq!(req, Request::StoreAndStop);
    }

    #[test]
    fn error_response() {
        let resp = Response::error("file \"a\" does not exist");
        assert!(resp.is_error());
        assert_eq!(
            serde_json::to_value(&resp).unwrap()["message"],
            "file \"a\" does not exist"
        );
    }
}
