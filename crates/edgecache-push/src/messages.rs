//! Wire format of the push channel: JSON objects tagged by `msg`.

use serde::{Deserialize, Serialize};

use edgecache_store::StorageObject;

use crate::PushError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg")]
pub enum PushMessage {
    /// Ask the service to watch a path. Sent by us.
    #[serde(rename = "registerPath")]
    RegisterPath {
        #[serde(rename = "companyId")]
        company_id: String,
        path: String,
    },

    /// A watched object changed.
    #[serde(rename = "gcs-update")]
    StorageUpdate(StorageUpdate),

    /// Sequence heartbeat for missed-message detection.
    #[serde(rename = "last-message-time")]
    Heartbeat {
        #[serde(rename = "displayId", default, skip_serializing_if = "Option::is_none")]
        display_id: Option<String>,
        #[serde(rename = "lastMessageTime")]
        last_message_time: u64,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Uploaded,
    Deleted,
    PermissionsUpdated,
    #[serde(other)]
    Other,
}

impl ChangeKind {
    /// Whether the cached file must go, not just its validators.
    pub fn removes_content(&self) -> bool {
        matches!(self, ChangeKind::Deleted | ChangeKind::PermissionsUpdated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(rename = "companyId", default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    /// Bucket-relative object path.
    pub resource: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(rename = "messageTime", default, skip_serializing_if = "Option::is_none")]
    pub message_time: Option<u64>,
}

impl StorageUpdate {
    /// The changed object, when the update names its bucket or company.
    pub fn object(&self) -> Option<StorageObject> {
        let path = self.resource.trim_start_matches('/');
        match (&self.bucket, &self.company_id) {
            (Some(bucket), _) if !bucket.is_empty() => Some(StorageObject::new(bucket.as_str(), path)),
            (_, Some(company)) if !company.is_empty() => {
                Some(StorageObject::for_company(company, path))
            }
            _ => None,
        }
    }
}

impl PushMessage {
    pub fn register_path(company_id: impl Into<String>, path: impl Into<String>) -> Self {
        PushMessage::RegisterPath {
            company_id: company_id.into(),
            path: path.into(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, PushError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, PushError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_path_wire_shape() {
        let json = PushMessage::register_path("abc", "img/logo.png")
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["msg"], "registerPath");
        assert_eq!(value["companyId"], "abc");
        assert_eq!(value["path"], "img/logo.png");
    }

    #[test]
    fn test_parse_storage_update() {
        let msg = PushMessage::parse(
            r#"{"msg":"gcs-update","companyId":"abc","resource":"img/logo.png","type":"permissionsUpdated","messageTime":42}"#,
        )
        .unwrap();
        let PushMessage::StorageUpdate(update) = msg else {
            panic!("expected an update");
        };
        assert_eq!(update.kind, ChangeKind::PermissionsUpdated);
        assert!(update.kind.removes_content());
        assert_eq!(update.message_time, Some(42));
        assert_eq!(
            update.object(),
            Some(StorageObject::new("risemedialibrary-abc", "img/logo.png"))
        );
    }

    #[test]
    fn test_explicit_bucket_wins() {
        let msg = PushMessage::parse(
            r#"{"msg":"gcs-update","bucket":"other","companyId":"abc","resource":"/a.png","type":"uploaded"}"#,
        )
        .unwrap();
        let PushMessage::StorageUpdate(update) = msg else {
            panic!("expected an update");
        };
        assert_eq!(update.object(), Some(StorageObject::new("other", "a.png")));
        assert!(!update.kind.removes_content());
    }

    #[test]
    fn test_unknown_change_kind_and_message() {
        let msg = PushMessage::parse(
            r#"{"msg":"gcs-update","companyId":"abc","resource":"a","type":"archived"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            PushMessage::StorageUpdate(StorageUpdate {
                kind: ChangeKind::Other,
                ..
            })
        ));

        let msg = PushMessage::parse(r#"{"msg":"server-hello","version":3}"#).unwrap();
        assert_eq!(msg, PushMessage::Unknown);
    }

    #[test]
    fn test_parse_heartbeat() {
        let msg = PushMessage::parse(
            r#"{"msg":"last-message-time","displayId":"D1","lastMessageTime":1700000000}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            PushMessage::Heartbeat {
                display_id: Some("D1".into()),
                last_message_time: 1_700_000_000
            }
        );
    }

    #[test]
    fn test_update_without_owner_has_no_object() {
        let update = StorageUpdate {
            bucket: None,
            company_id: None,
            resource: "a.png".into(),
            kind: ChangeKind::Uploaded,
            message_time: None,
        };
        assert!(update.object().is_none());
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(PushMessage::parse("{not json").is_err());
    }
}
