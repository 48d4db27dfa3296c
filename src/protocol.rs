//! Control messages exchanged over the data channel.
//!
//! Control traffic is JSON text, externally tagged with `type` and carrying
//! its fields under `payload`, matching the relay-era wire format
//! (`file-offer`, `file-accept`, ...). Bulk data never travels as control
//! messages; chunks use the binary frames in [`crate::codec`].

use serde::{Deserialize, Serialize};

/// A control message on the data channel.
///
/// Unknown `type` tags fail deserialization; the transport logs and drops
/// them (protocol-violation class, never fatal to the session).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Chat text.
    Message { text: String },
    /// Announces an outbound file before any chunk is sent. `file_hash` is
    /// the whole-file SHA-256 hex digest, advertised up front so the
    /// receiver can verify after assembly.
    #[serde(rename_all = "camelCase")]
    FileOffer {
        file_id: String,
        file_name: String,
        file_size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_hash: Option<String>,
    },
    /// Receiver accepts the offer; the sender starts streaming chunks.
    #[serde(rename_all = "camelCase")]
    FileAccept { file_id: String },
    /// Receiver declines the offer; the sender drops the transfer.
    #[serde(rename_all = "camelCase")]
    FileDecline { file_id: String },
    /// Sender aborts an in-flight upload.
    #[serde(rename_all = "camelCase")]
    FileCancelUpload { file_id: String },
    /// Receiver aborts an in-flight download.
    #[serde(rename_all = "camelCase")]
    FileCancelDownload { file_id: String },
}

impl ControlMessage {
    /// The transfer id this message refers to, if any.
    pub fn file_id(&self) -> Option<&str> {
        match self {
            ControlMessage::Message { .. } => None,
            ControlMessage::FileOffer { file_id, .. }
            | ControlMessage::FileAccept { file_id }
            | ControlMessage::FileDecline { file_id }
            | ControlMessage::FileCancelUpload { file_id }
            | ControlMessage::FileCancelDownload { file_id } => Some(file_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_wire_shape() {
        let msg = ControlMessage::FileOffer {
            file_id: "f1".into(),
            file_name: "report.pdf".into(),
            file_size: 1024,
            file_hash: Some("abcd".into()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "file-offer");
        assert_eq!(json["payload"]["fileId"], "f1");
        assert_eq!(json["payload"]["fileName"], "report.pdf");
        assert_eq!(json["payload"]["fileSize"], 1024);
        assert_eq!(json["payload"]["fileHash"], "abcd");
    }

    #[test]
    fn accept_round_trip() {
        let msg = ControlMessage::FileAccept {
            file_id: "f2".into(),
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: ControlMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
        assert!(text.contains("\"file-accept\""));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let parsed: Result<ControlMessage, _> =
            serde_json::from_str(r#"{"type":"file-chunk","payload":{"fileId":"x"}}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn hash_is_omitted_when_absent() {
        let msg = ControlMessage::FileOffer {
            file_id: "f".into(),
            file_name: "n".into(),
            file_size: 0,
            file_hash: None,
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(!text.contains("fileHash"));
    }
}
