//! Queue messages and dispatch by job type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use collectionjobs_core::JobId;

use super::error::JobError;
use super::import::ImportCompaniesHandler;
use super::types::ImportState;
use crate::storage::Session;

/// Job kind carried by a message.
///
/// Known kinds are matched exhaustively. Tags this build doesn't recognise are kept
/// verbatim in `Other` so they can be logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    ImportCompaniesToCollection,
    Other(String),
}

impl MessageType {
    pub const IMPORT_COMPANIES_TO_COLLECTION: &'static str = "import_companies_to_collection";

    pub fn as_str(&self) -> &str {
        match self {
            MessageType::ImportCompaniesToCollection => Self::IMPORT_COMPANIES_TO_COLLECTION,
            MessageType::Other(tag) => tag.as_str(),
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        if tag == Self::IMPORT_COMPANIES_TO_COLLECTION {
            MessageType::ImportCompaniesToCollection
        } else {
            MessageType::Other(tag)
        }
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl core::fmt::Display for MessageType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope for one batch of a job.
///
/// Every continuation of a job keeps the `id` and `message_type` of the message that
/// started it; only the payload moves forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: JobId,
    pub message_type: MessageType,
    pub payload: Map<String, Value>,
}

impl Message {
    pub fn new(id: JobId, message_type: MessageType, payload: Map<String, Value>) -> Self {
        Self {
            id,
            message_type,
            payload,
        }
    }

    /// Message starting (or resuming) an import job from `state`.
    pub fn import_companies(id: JobId, state: &ImportState) -> Result<Self, JobError> {
        Ok(Self::new(
            id,
            MessageType::ImportCompaniesToCollection,
            to_payload(state)?,
        ))
    }

    /// Build a message from a persisted job state blob.
    pub fn from_state(
        id: JobId,
        message_type: MessageType,
        state: &Value,
    ) -> Result<Self, JobError> {
        match state {
            Value::Object(payload) => Ok(Self::new(id, message_type, payload.clone())),
            other => Err(JobError::InvalidPayload(format!(
                "job state must be an object, got {other}"
            ))),
        }
    }

    /// Next message for the same job carrying `payload`.
    pub fn continuation(&self, payload: Map<String, Value>) -> Self {
        Self::new(self.id, self.message_type.clone(), payload)
    }

    /// Decode the payload into a typed state.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| JobError::InvalidPayload(e.to_string()))
    }
}

/// Serialize a state struct into a message payload.
pub fn to_payload<T: Serialize>(state: &T) -> Result<Map<String, Value>, JobError> {
    match serde_json::to_value(state).map_err(|e| JobError::InvalidPayload(e.to_string()))? {
        Value::Object(payload) => Ok(payload),
        other => Err(JobError::InvalidPayload(format!(
            "payload must serialize to an object, got {other}"
        ))),
    }
}

/// What a worker should do after a message was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// More work remains; resubmit this message.
    Continue(Message),
    /// The job is complete.
    Done,
    /// The message type is not handled here; it was consumed without effect.
    Unknown,
}

/// Routes messages to the handler for their job type.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    import: ImportCompaniesHandler,
}

impl Dispatcher {
    pub fn new(import: ImportCompaniesHandler) -> Self {
        Self { import }
    }

    /// Handle one message inside `session`.
    pub fn dispatch<S: Session>(
        &self,
        message: &Message,
        session: &mut S,
    ) -> Result<Dispatched, JobError> {
        match &message.message_type {
            MessageType::ImportCompaniesToCollection => {
                Ok(match self.import.handle(message, session)? {
                    Some(next) => Dispatched::Continue(next),
                    None => Dispatched::Done,
                })
            }
            MessageType::Other(tag) => {
                info!(job_id = %message.id, message_type = %tag, "received unknown message type");
                Ok(Dispatched::Unknown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStorage, Storage};
    use collectionjobs_core::{CollectionId, CompanyId};

    #[test]
    fn message_type_parses_known_and_unknown_tags() {
        assert_eq!(
            MessageType::from("import_companies_to_collection"),
            MessageType::ImportCompaniesToCollection
        );
        assert_eq!(
            MessageType::from("reindex_everything"),
            MessageType::Other("reindex_everything".to_string())
        );
        assert_eq!(
            MessageType::Other("reindex_everything".to_string()).as_str(),
            "reindex_everything"
        );
    }

    #[test]
    fn message_type_serializes_as_its_tag() {
        let json = serde_json::to_string(&MessageType::ImportCompaniesToCollection).unwrap();
        assert_eq!(json, "\"import_companies_to_collection\"");

        let parsed: MessageType = serde_json::from_str("\"something_else\"").unwrap();
        assert_eq!(parsed, MessageType::Other("something_else".to_string()));
    }

    #[test]
    fn continuation_keeps_identity() {
        let state = ImportState::new(CollectionId::new(), CollectionId::new(), vec![]);
        let message = Message::import_companies(JobId::new(), &state).unwrap();

        let next_state = ImportState { cursor: 25, ..state };
        let next = message.continuation(to_payload(&next_state).unwrap());

        assert_eq!(next.id, message.id);
        assert_eq!(next.message_type, message.message_type);
        assert_eq!(next.decode::<ImportState>().unwrap().cursor, 25);
    }

    #[test]
    fn from_state_rejects_non_objects() {
        let err = Message::from_state(
            JobId::new(),
            MessageType::ImportCompaniesToCollection,
            &serde_json::json!([1, 2, 3]),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));
    }

    #[test]
    fn unknown_type_is_consumed_without_touching_storage() {
        let storage = InMemoryStorage::new();
        let source = CollectionId::new();
        storage.add_companies(source, [CompanyId::new(1)]);

        let message = Message::new(
            JobId::new(),
            MessageType::from("export_to_crm"),
            serde_json::Map::new(),
        );

        let mut session = storage.begin().unwrap();
        let outcome = Dispatcher::default().dispatch(&message, &mut session).unwrap();
        session.commit().unwrap();

        assert_eq!(outcome, Dispatched::Unknown);
        assert!(storage.job(message.id).is_none());
    }

    #[test]
    fn malformed_import_payload_is_an_error() {
        let storage = InMemoryStorage::new();
        let mut payload = serde_json::Map::new();
        payload.insert("cursor".to_string(), serde_json::json!("not a number"));
        let message = Message::new(JobId::new(), MessageType::ImportCompaniesToCollection, payload);

        let mut session = storage.begin().unwrap();
        let err = Dispatcher::default()
            .dispatch(&message, &mut session)
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));
    }
}
