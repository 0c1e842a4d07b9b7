//! Explicit message registry
//!
//! Maps message type ids to decoders. A registry is an ordinary value built
//! by whoever owns the serialization layer and handed to the code that needs
//! it, so two engines in one process can accept different message sets.

use crate::error::{CodecError, Result};
use crate::message::{decode, MessageHeader, MessageType, WireMessage};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use tracing::debug;

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send>>;

struct Registration {
    version: u8,
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

/// A payload decoded through the registry
pub struct DecodedMessage {
    pub message_type: MessageType,
    value: Box<dyn Any + Send>,
}

impl DecodedMessage {
    /// Borrow the message if it is an `M`
    pub fn downcast_ref<M: WireMessage>(&self) -> Option<&M> {
        self.value.downcast_ref::<M>()
    }

    /// Take the message out if it is an `M`
    pub fn downcast<M: WireMessage>(self) -> std::result::Result<M, Self> {
        let message_type = self.message_type;
        self.value
            .downcast::<M>()
            .map(|boxed| *boxed)
            .map_err(|value| Self {
                message_type,
                value,
            })
    }
}

impl std::fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct MessageRegistry {
    entries: HashMap<MessageType, Registration>,
}

fn decode_boxed<M: WireMessage>(payload: &[u8]) -> Result<Box<dyn Any + Send>> {
    decode::<M>(payload).map(|message| Box::new(message) as Box<dyn Any + Send>)
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `Ping`/`Pong` pair
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register::<crate::Ping>();
        registry.register::<crate::Pong>();
        registry
    }

    /// Register `M`, replacing any earlier registration of the same type id
    pub fn register<M: WireMessage>(&mut self) -> &mut Self {
        let registration = Registration {
            version: M::VERSION,
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            decode: decode_boxed::<M>,
        };
        if let Some(previous) = self.entries.insert(M::MESSAGE_TYPE, registration) {
            debug!(
                message_type = ?M::MESSAGE_TYPE,
                previous = previous.type_name,
                "Replaced message registration"
            );
        }
        self
    }

    pub fn is_registered(&self, message_type: MessageType) -> bool {
        self.entries.contains_key(&message_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode any registered message
    pub fn decode(&self, payload: &[u8]) -> Result<DecodedMessage> {
        let header = MessageHeader::parse(payload)?;
        let message_type = header.message_type()?;
        let registration = self.lookup(message_type)?;

        if header.version != registration.version {
            return Err(CodecError::VersionMismatch {
                message_type: header.message_type,
                expected: registration.version,
                actual: header.version,
            });
        }

        let value = (registration.decode)(payload)?;
        Ok(DecodedMessage {
            message_type,
            value,
        })
    }

    /// Decode a payload that must hold a registered `M`
    pub fn decode_as<M: WireMessage>(&self, payload: &[u8]) -> Result<M> {
        let registration = self.lookup(M::MESSAGE_TYPE)?;
        if registration.type_id != TypeId::of::<M>() {
            return Err(CodecError::NotRegistered {
                message_type: M::MESSAGE_TYPE as u8,
            });
        }
        decode::<M>(payload)
    }

    fn lookup(&self, message_type: MessageType) -> Result<&Registration> {
        self.entries
            .get(&message_type)
            .ok_or(CodecError::NotRegistered {
                message_type: message_type as u8,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{to_bytes, Ping, Pong};

    #[test]
    fn test_builtin_registry_decodes_both_types() {
        let registry = MessageRegistry::with_builtin();
        assert_eq!(registry.len(), 2);

        let decoded = registry.decode(&to_bytes(&Ping { id: 3 })).unwrap();
        assert_eq!(decoded.message_type, MessageType::Ping);
        assert_eq!(decoded.downcast_ref::<Ping>(), Some(&Ping { id: 3 }));

        let decoded = registry.decode(&to_bytes(&Pong { ping_id: 4 })).unwrap();
        assert_eq!(decoded.downcast::<Pong>().unwrap(), Pong { ping_id: 4 });
    }

    #[test]
    fn test_unregistered_type_is_rejected() {
        let mut registry = MessageRegistry::new();
        registry.register::<Ping>();

        let err = registry.decode(&to_bytes(&Pong { ping_id: 1 })).unwrap_err();
        assert_eq!(err, CodecError::NotRegistered { message_type: 2 });
        assert!(registry.decode_as::<Pong>(&to_bytes(&Pong { ping_id: 1 })).is_err());
    }

    #[test]
    fn test_registries_are_independent() {
        let mut pings_only = MessageRegistry::new();
        pings_only.register::<Ping>();
        let full = MessageRegistry::with_builtin();

        assert!(!pings_only.is_registered(MessageType::Pong));
        assert!(full.is_registered(MessageType::Pong));
    }

    #[test]
    fn test_version_mismatch_is_protocol_error() {
        let registry = MessageRegistry::with_builtin();
        let mut payload = to_bytes(&Ping { id: 1 }).to_vec();
        payload[1] = 2;
        assert!(matches!(
            registry.decode(&payload),
            Err(CodecError::VersionMismatch { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn test_downcast_wrong_type_returns_message() {
        let registry = MessageRegistry::with_builtin();
        let decoded = registry.decode(&to_bytes(&Ping { id: 8 })).unwrap();
        let decoded = decoded.downcast::<Pong>().unwrap_err();
        assert_eq!(decoded.downcast_ref::<Ping>(), Some(&Ping { id: 8 }));
    }
}
