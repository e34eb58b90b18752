use std::collections::HashMap;
use std::fmt;

/// Wire message type.
///
/// Values are partitioned into ranges, see [`TypeRange`]. Any `u16` decodes;
/// whether a type is *recognized* is a [`TypeRegistry`] question.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(pub u16);

/// Reserved ranges of the message type space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeRange {
    /// `0x0000..=0x00FF`: protocol and control messages.
    Control,
    /// `0x0100..=0x7FFF`: domain messages.
    Domain,
    /// `0x8000..=0xFFFF`: application extensions.
    Extension,
}

impl MessageType {
    pub const COMPLETION_REQUEST: Self = Self(0x0001);
    pub const COMPLETION_RESPONSE: Self = Self(0x0002);
    pub const STREAM_CHUNK: Self = Self(0x0003);
    pub const ERROR: Self = Self(0x0004);
    pub const HEARTBEAT: Self = Self(0x0005);
    pub const HANDSHAKE: Self = Self(0x0010);
    pub const HANDSHAKE_ACK: Self = Self(0x0011);
    pub const DISCONNECT: Self = Self(0x0012);

    pub const ASK_REQUEST: Self = Self(0x0100);
    pub const ASK_RESPONSE: Self = Self(0x0101);
    pub const EDIT_REQUEST: Self = Self(0x0102);
    pub const EDIT_RESPONSE: Self = Self(0x0103);
    pub const CHAT_MESSAGE: Self = Self(0x0104);
    pub const TOOL_CALL: Self = Self(0x0105);
    pub const TOOL_RESULT: Self = Self(0x0106);

    /// Every type this crate knows by name.
    pub const BUILTIN: [(Self, &'static str); 15] = [
        (Self::COMPLETION_REQUEST, "CompletionRequest"),
        (Self::COMPLETION_RESPONSE, "CompletionResponse"),
        (Self::STREAM_CHUNK, "StreamChunk"),
        (Self::ERROR, "Error"),
        (Self::HEARTBEAT, "Heartbeat"),
        (Self::HANDSHAKE, "Handshake"),
        (Self::HANDSHAKE_ACK, "HandshakeAck"),
        (Self::DISCONNECT, "Disconnect"),
        (Self::ASK_REQUEST, "AskRequest"),
        (Self::ASK_RESPONSE, "AskResponse"),
        (Self::EDIT_REQUEST, "EditRequest"),
        (Self::EDIT_RESPONSE, "EditResponse"),
        (Self::CHAT_MESSAGE, "ChatMessage"),
        (Self::TOOL_CALL, "ToolCall"),
        (Self::TOOL_RESULT, "ToolResult"),
    ];

    pub const fn range(self) -> TypeRange {
        match self.0 {
            0x0000..=0x00FF => TypeRange::Control,
            0x0100..=0x7FFF => TypeRange::Domain,
            _ => TypeRange::Extension,
        }
    }

    #[inline]
    pub const fn is_control(self) -> bool {
        matches!(self.range(), TypeRange::Control)
    }

    /// Name of a built-in type.
    pub fn builtin_name(self) -> Option<&'static str> {
        Self::BUILTIN
            .iter()
            .find(|(ty, _)| *ty == self)
            .map(|(_, name)| *name)
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.builtin_name() {
            Some(name) => write!(f, "{name}({:#06x})", self.0),
            None => write!(f, "MessageType({:#06x})", self.0),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<u16> for MessageType {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> Self {
        value.0
    }
}

/// Set of message types a collaborator understands.
///
/// Frames with a type outside the registry still decode; the stream reports
/// them as unrecognized instead of treating them as corrupt.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    known: HashMap<MessageType, String>,
}

impl TypeRegistry {
    /// An empty registry. Control types are still always recognized.
    pub fn empty() -> Self {
        Self {
            known: HashMap::new(),
        }
    }

    /// A registry holding every built-in type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for (ty, name) in MessageType::BUILTIN {
            registry.known.insert(ty, name.to_string());
        }
        registry
    }

    /// Register a type. Returns `false` if it was already present.
    pub fn register(&mut self, ty: MessageType, name: impl Into<String>) -> bool {
        if self.known.contains_key(&ty) {
            return false;
        }
        self.known.insert(ty, name.into());
        true
    }

    pub fn is_known(&self, ty: MessageType) -> bool {
        self.known.contains_key(&ty) || ty.builtin_name().is_some_and(|_| ty.is_control())
    }

    pub fn name(&self, ty: MessageType) -> Option<&str> {
        self.known.get(&ty).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_partition_the_space() {
        assert_eq!(MessageType::HEARTBEAT.range(), TypeRange::Control);
        assert_eq!(MessageType(0x00FF).range(), TypeRange::Control);
        assert_eq!(MessageType::ASK_REQUEST.range(), TypeRange::Domain);
        assert_eq!(MessageType(0x7FFF).range(), TypeRange::Domain);
        assert_eq!(MessageType(0x8000).range(), TypeRange::Extension);
        assert_eq!(MessageType(0xFFFF).range(), TypeRange::Extension);
    }

    #[test]
    fn registry_tracks_custom_types() {
        let mut registry = TypeRegistry::with_builtins();
        let custom = MessageType(0x8001);
        assert!(!registry.is_known(custom));
        assert!(registry.register(custom, "Telemetry"));
        assert!(!registry.register(custom, "Again"));
        assert!(registry.is_known(custom));
        assert_eq!(registry.name(custom), Some("Telemetry"));
        assert_eq!(registry.len(), MessageType::BUILTIN.len() + 1);
    }

    #[test]
    fn empty_registry_still_knows_control_types() {
        let registry = TypeRegistry::empty();
        assert!(registry.is_known(MessageType::DISCONNECT));
        assert!(!registry.is_known(MessageType::TOOL_CALL));
    }

    #[test]
    fn debug_uses_builtin_names() {
        assert_eq!(format!("{:?}", MessageType::HEARTBEAT), "Heartbeat(0x0005)");
        assert_eq!(format!("{}", MessageType(0x9000)), "MessageType(0x9000)");
    }
}
