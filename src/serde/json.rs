//! Contains the [`Serde`] compatible implementation using JSON.

use serde::{Deserialize, Serialize};

use crate::serde::Serde;

/// Implements the [`Serde`] trait for every serializable type, using the
/// [serde] crate to serialize and deserialize a message into JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl<T> Serde<T> for Json
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    type Error = serde_json::Error;

    fn serialize(&self, value: T) -> Vec<u8> {
        serde_json::to_vec(&value).expect("json serialization should not fail")
    }

    fn deserialize(&self, data: Vec<u8>) -> Result<T, Self::Error> {
        serde_json::from_slice(&data)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::message::{EventMessage, Headers};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct DepositRecorded {
        account: String,
        amount: u64,
    }

    #[test]
    fn event_collections_round_trip() {
        let events = vec![
            EventMessage::new(DepositRecorded {
                account: "acc-1".to_owned(),
                amount: 100,
            })
            .with_header("origin", "teller"),
            EventMessage::new(DepositRecorded {
                account: "acc-1".to_owned(),
                amount: 250,
            }),
        ];

        let serde = Json;
        let data = serde.serialize(events.clone());
        let decoded: Vec<EventMessage<DepositRecorded>> =
            serde.deserialize(data).expect("decoding should not fail");

        assert_eq!(events, decoded);
    }

    #[test]
    fn headers_round_trip() {
        let mut headers = Headers::default();
        headers.insert("attempt".to_owned(), 3.into());
        headers.insert("origin".to_owned(), "import".into());
        headers.insert(
            "tags".to_owned(),
            serde_json::json!(["billing", "backfill"]),
        );

        let serde = Json;
        let decoded: Headers = serde
            .deserialize(serde.serialize(headers.clone()))
            .expect("decoding should not fail");

        assert_eq!(headers, decoded);
    }

    #[test]
    fn snapshot_payloads_round_trip() {
        let payload: HashMap<String, u64> =
            [("acc-1".to_owned(), 350), ("acc-2".to_owned(), 40)].into();

        let serde = Json;
        let decoded: HashMap<String, u64> = serde
            .deserialize(serde.serialize(payload.clone()))
            .expect("decoding should not fail");

        assert_eq!(payload, decoded);
    }
}
