//! Pluggable marshaller. The producer only needs a `name()` content-type
//! and a `marshal` call; JSON is the only implementation shipped.

use serde::Serialize;

/// Default (and only) marshaller. A generic `marshal<T>` keeps this
/// dependency-free — an object-safe `Marshaller` trait would need
/// `erased_serde`, which nothing else in the pack pulls in.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl JsonMarshaller {
    pub fn name(&self) -> &'static str {
        "application/json"
    }

    pub fn marshal<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Payload {
        id: u32,
        label: String,
    }

    #[test]
    fn marshals_to_json_bytes() {
        let marshaller = JsonMarshaller;
        let bytes = marshaller
            .marshal(&Payload {
                id: 7,
                label: "hello".to_string(),
            })
            .unwrap();
        assert_eq!(bytes, br#"{"id":7,"label":"hello"}"#);
    }

    #[test]
    fn name_is_json_content_type() {
        assert_eq!(JsonMarshaller.name(), "application/json");
    }
}
