//! Session fabric message types
//!
//! Two planes meet in the fabric: the control plane shared with the
//! execution back-end (commands out, replies in, one stream for all
//! components) and the per-component message-passing plane. Message
//! kinds are tagged variants; the receive loops match on the tag and
//! log-and-ignore anything they do not know.

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, Result};
use crate::store::{EncodedObject, Language, ObjectRef};

/// The `functionName::sessionID::instanceID` routing key used across
/// the back-end control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeId {
    /// Function name
    pub name: String,
    /// Session the invocation belongs to
    pub session_id: String,
    /// Component instance
    pub instance_id: String,
}

impl RuntimeId {
    /// Parse `name::sessionID::instanceID`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, "::");
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(session_id), Some(instance_id))
                if !name.is_empty() && !session_id.is_empty() && !instance_id.is_empty() =>
            {
                Ok(Self {
                    name: name.to_string(),
                    session_id: session_id.to_string(),
                    instance_id: instance_id.to_string(),
                })
            }
            _ => Err(FabricError::internal(format!("malformed runtime id {raw:?}"))),
        }
    }

    /// The routing-map key `sessionID::instanceID`.
    pub fn routing_key(&self) -> String {
        format!("{}::{}", self.session_id, self.instance_id)
    }
}

impl std::fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}::{}", self.name, self.session_id, self.instance_id)
    }
}

/// One invocation argument on the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ArgValue {
    /// The back-end already holds the object
    Ref {
        /// Object identity
        id: String,
        /// Back-end store holding the bytes; empty when the exact
        /// store is not yet known
        source: String,
    },
    /// Inline encoded bytes
    Encoded(EncodedObject),
}

/// Commands written to the shared back-end stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackendCommand {
    /// Session attached and ready
    Ready {
        /// Component instance
        instance_id: String,
    },
    /// Ship a component's packed handler; at most once per component
    AppendFunction {
        /// Session the function belongs to
        session_id: String,
        /// Component instance
        instance_id: String,
        /// Function name
        name: String,
        /// Handler language
        language: Language,
        /// Packed handler bytes
        payload: Vec<u8>,
    },
    /// Stage one invocation argument
    AppendArg {
        /// Session the invocation belongs to
        session_id: String,
        /// Component instance
        instance_id: String,
        /// The argument
        value: ArgValue,
    },
    /// Run the staged invocation
    Invoke {
        /// Session the invocation belongs to
        session_id: String,
        /// Component instance
        instance_id: String,
        /// Function name
        name: String,
    },
    /// Ask the back-end for an object's bytes
    RequestObject {
        /// Object identity
        id: String,
    },
}

/// A function result on the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReturnValue {
    /// The back-end kept the value; fetch by reference
    Ref {
        /// Object identity
        id: String,
        /// Back-end store holding the bytes
        store_id: String,
    },
    /// Inline encoded value
    Encoded(EncodedObject),
}

/// Replies read from the shared back-end stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackendReply {
    /// An invocation finished
    ReturnResult {
        /// Session the invocation belonged to
        session_id: String,
        /// Component instance
        instance_id: String,
        /// Function name
        name: String,
        /// Failure detail, when the invocation failed
        error: Option<String>,
        /// The result, when it succeeded
        value: Option<ReturnValue>,
    },
    /// Bytes answering a prior [`BackendCommand::RequestObject`]
    ResponseObject {
        /// The requested object
        object: EncodedObject,
        /// Back-end store the bytes came from
        store_id: String,
    },
}

/// Messages on a component's message-passing socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ComponentMessage {
    /// Socket attached
    Ready,
    /// The component's packed handler
    Function {
        /// Function name
        name: String,
        /// Handler language
        language: Language,
        /// Packed handler bytes
        payload: Vec<u8>,
    },
    /// Run the handler with these arguments
    InvokeRequest {
        /// `name::sessionID::instanceID`
        runtime_id: String,
        /// Argument references
        args: Vec<ObjectRef>,
    },
    /// Result of a prior invocation
    InvokeResponse {
        /// `name::sessionID::instanceID`
        runtime_id: String,
        /// Failure detail, when the invocation failed
        error: Option<String>,
        /// Reference to the result in the local store
        value: Option<ObjectRef>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_id_round_trips() {
        let rid = RuntimeId::parse("avg::sess-1::inst-9").unwrap();
        assert_eq!(rid.name, "avg");
        assert_eq!(rid.session_id, "sess-1");
        assert_eq!(rid.instance_id, "inst-9");
        assert_eq!(rid.routing_key(), "sess-1::inst-9");
        assert_eq!(rid.to_string(), "avg::sess-1::inst-9");
    }

    #[test]
    fn malformed_runtime_ids_are_rejected() {
        assert!(RuntimeId::parse("").is_err());
        assert!(RuntimeId::parse("only-name").is_err());
        assert!(RuntimeId::parse("a::b").is_err());
        assert!(RuntimeId::parse("::b::c").is_err());
    }
}
