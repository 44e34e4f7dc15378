//! Provides abstraction for xDS resources.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::error::Result;
use bytes::Bytes;

pub mod xdstp;

/// Type-specific decoding for the payloads of one resource type.
///
/// The multiplexer treats decoders opaquely: it hands each payload to the
/// decoder registered for the type and passes the result through, unmodified,
/// to the watches of that type.
///
/// # Validation
///
/// `decode_resource` should:
/// - Parse the raw bytes based on the serialization format, such as Protobuf.
/// - Validate the parsed resource against the expected schema.
///
/// It should return `Err` if parsing fails or validation fails.
/// The error message will be included in the NACK's `error_detail`.
pub trait OpaqueResourceDecoder {
    /// Decode and validate a resource from its serialized bytes.
    fn decode_resource(&self, bytes: Bytes) -> Result<Box<dyn Any>>;
}

/// A resource from a delta response, decoded by its type's
/// [`OpaqueResourceDecoder`].
///
/// Cloning is cheap; the decoded value is shared between every watch the
/// resource is delivered to.
#[derive(Clone)]
pub struct DecodedResource {
    name: String,
    version: String,
    resource: Rc<dyn Any>,
}

impl DecodedResource {
    /// Wrap a decoded value with its name and version.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        resource: Box<dyn Any>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            resource: Rc::from(resource),
        }
    }

    /// The resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resource version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The decoded value, as produced by the decoder.
    pub fn resource(&self) -> &dyn Any {
        self.resource.as_ref()
    }

    /// Downcast the decoded value to a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.resource).downcast_ref::<T>()
    }
}

impl fmt::Debug for DecodedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedResource")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("resource", &"<decoded>")
            .finish()
    }
}
