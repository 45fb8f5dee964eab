use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

// One macro for every id wrapper so the wire and column encodings never drift apart.
macro_rules! define_storage_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(raw: Uuid) -> Self {
                Self(raw)
            }

            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
                    stage: "parse-storage-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_storage_id!(ParticipantId, "participant-id");
define_storage_id!(ConversationId, "conversation-id");
define_storage_id!(MessageId, "message-id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_output_parses_back_to_the_same_id() {
        let id = MessageId::new_v7();
        let parsed: MessageId = id.to_string().parse().expect("display form should parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn invalid_text_reports_the_id_type() {
        let error = ConversationId::parse("not-a-uuid").expect_err("garbage must not parse");
        match error {
            StorageError::InvalidId { id_type, raw, .. } => {
                assert_eq!(id_type, "conversation-id");
                assert_eq!(raw, "not-a-uuid");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn hyphenated_text_order_matches_uuid_order() {
        let earlier = MessageId::new_v7();
        let later = MessageId::new_v7();
        assert!(earlier < later);
        assert!(earlier.to_string() < later.to_string());
    }
}
