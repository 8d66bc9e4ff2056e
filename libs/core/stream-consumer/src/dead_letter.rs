//! Dead-letter stream
//!
//! A dead-lettered message is appended to a separate stream with its original
//! payload fields copied verbatim, plus `dlq:`-prefixed metadata fields.
//! Payload fields that already start with `dlq:` are stored under
//! `dlq:payload:<name>` so they never shadow the metadata.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::ConsumerError;
use crate::message::{EntryId, Fields, Message};
use crate::store::StreamStore;

const PREFIX: &str = "dlq:";
const ESCAPED_PAYLOAD: &str = "dlq:payload:";

/// Record written to the dead-letter stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEntry {
    pub original_id: EntryId,
    pub source_stream: String,
    pub group: String,
    pub consumer: String,
    pub delivery_count: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    pub payload: Fields,
}

impl DeadLetterEntry {
    pub fn new(
        message: &Message,
        source_stream: &str,
        group: &str,
        consumer: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            original_id: message.id(),
            source_stream: source_stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            delivery_count: message.delivery_count(),
            reason: reason.into(),
            failed_at: Utc::now(),
            payload: message.payload().clone(),
        }
    }

    /// Flatten into stream fields
    pub fn to_fields(&self) -> Fields {
        let mut fields: Fields = self
            .payload
            .iter()
            .map(|(key, value)| {
                let key = if key.starts_with(PREFIX) {
                    format!("{}{}", ESCAPED_PAYLOAD, key)
                } else {
                    key.clone()
                };
                (key, value.clone())
            })
            .collect();
        let meta = [
            ("original_id", self.original_id.to_string()),
            ("stream", self.source_stream.clone()),
            ("group", self.group.clone()),
            ("consumer", self.consumer.clone()),
            ("delivery_count", self.delivery_count.to_string()),
            ("reason", self.reason.clone()),
            ("failed_at", self.failed_at.to_rfc3339()),
        ];
        for (key, value) in meta {
            fields.insert(format!("{}{}", PREFIX, key), value.into_bytes());
        }
        fields
    }

    /// Rebuild an entry read back from the dead-letter stream
    pub fn from_fields(fields: &Fields) -> Result<Self, ConsumerError> {
        let meta = |key: &str| -> Result<String, ConsumerError> {
            fields
                .get(&format!("{}{}", PREFIX, key))
                .and_then(|v| String::from_utf8(v.clone()).ok())
                .ok_or_else(|| ConsumerError::Malformed(format!("dead-letter entry without {}", key)))
        };

        let payload = fields
            .iter()
            .filter_map(|(k, v)| match k.strip_prefix(ESCAPED_PAYLOAD) {
                Some(original) => Some((original.to_string(), v.clone())),
                None if k.starts_with(PREFIX) => None,
                None => Some((k.clone(), v.clone())),
            })
            .collect();

        Ok(Self {
            original_id: meta("original_id")?.parse()?,
            source_stream: meta("stream")?,
            group: meta("group")?,
            consumer: meta("consumer")?,
            delivery_count: meta("delivery_count")?
                .parse()
                .map_err(|_| ConsumerError::Malformed("dead-letter delivery_count".into()))?,
            reason: meta("reason")?,
            failed_at: DateTime::parse_from_rfc3339(&meta("failed_at")?)
                .map_err(|e| ConsumerError::Malformed(format!("dead-letter failed_at: {}", e)))?
                .with_timezone(&Utc),
            payload,
        })
    }
}

/// Appends entries to the dead-letter stream
#[derive(Clone)]
pub struct DeadLetterWriter {
    store: Arc<dyn StreamStore>,
    stream: String,
    max_len: Option<usize>,
}

impl DeadLetterWriter {
    pub fn new(store: Arc<dyn StreamStore>, stream: impl Into<String>, max_len: Option<usize>) -> Self {
        Self {
            store,
            stream: stream.into(),
            max_len,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub async fn write(&self, entry: &DeadLetterEntry) -> Result<EntryId, ConsumerError> {
        let dlq_id = self
            .store
            .append(&self.stream, entry.to_fields(), self.max_len)
            .await?;

        info!(
            message_id = %entry.original_id,
            dlq_id = %dlq_id,
            dlq_stream = %self.stream,
            delivery_count = entry.delivery_count,
            reason = %entry.reason,
            "Moved message to dead-letter stream"
        );

        Ok(dlq_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn message() -> Message {
        let mut payload = Fields::new();
        payload.insert("order_id".into(), b"42".to_vec());
        payload.insert("body".into(), vec![0, 159, 146, 150]);
        Message::new(EntryId::new(1_700_000_000_000, 1), payload, 5)
    }

    #[test]
    fn test_fields_keep_payload_verbatim() {
        let entry = DeadLetterEntry::new(&message(), "orders", "billing", "worker-1", "boom");
        let fields = entry.to_fields();

        assert_eq!(fields.get("order_id"), Some(&b"42".to_vec()));
        assert_eq!(fields.get("body"), Some(&vec![0, 159, 146, 150]));
        assert_eq!(fields.get("dlq:reason"), Some(&b"boom".to_vec()));
        assert_eq!(fields.get("dlq:original_id"), Some(&b"1700000000000-1".to_vec()));
        assert_eq!(fields.get("dlq:delivery_count"), Some(&b"5".to_vec()));
    }

    #[test]
    fn test_from_fields_restores_entry() {
        let entry = DeadLetterEntry::new(&message(), "orders", "billing", "worker-1", "boom");
        let restored = DeadLetterEntry::from_fields(&entry.to_fields()).unwrap();

        // RFC 3339 keeps sub-second precision
        assert_eq!(restored, entry);
    }

    #[test]
    fn test_payload_field_with_metadata_prefix_is_kept_apart() {
        let base = message();
        let mut payload = base.payload().clone();
        payload.insert("dlq:reason".into(), b"from the producer".to_vec());
        let message = Message::new(base.id(), payload, base.delivery_count());

        let entry = DeadLetterEntry::new(&message, "orders", "billing", "worker-1", "boom");
        let fields = entry.to_fields();

        assert_eq!(fields.get("dlq:reason"), Some(&b"boom".to_vec()));
        assert_eq!(
            fields.get("dlq:payload:dlq:reason"),
            Some(&b"from the producer".to_vec())
        );

        let restored = DeadLetterEntry::from_fields(&fields).unwrap();
        assert_eq!(restored.reason, "boom");
        assert_eq!(
            restored.payload.get("dlq:reason"),
            Some(&b"from the producer".to_vec())
        );
        assert_eq!(restored, entry);
    }

    #[test]
    fn test_from_fields_rejects_plain_entry() {
        let err = DeadLetterEntry::from_fields(message().payload()).unwrap_err();
        assert!(matches!(err, ConsumerError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_writer_appends_to_dead_letter_stream() {
        let store = Arc::new(MemoryStore::new());
        let writer = DeadLetterWriter::new(store.clone(), "orders:dlq", Some(10));
        let entry = DeadLetterEntry::new(&message(), "orders", "billing", "worker-1", "boom");

        writer.write(&entry).await.unwrap();

        let stored = store.entries("orders:dlq");
        assert_eq!(stored.len(), 1);
        assert_eq!(DeadLetterEntry::from_fields(&stored[0].1).unwrap().reason, "boom");
    }
}
