//! The collection/serialization layer: packs heterogeneous observed
//! values into a compact self-describing binary frame per sampling
//! tick, with string interning, enum coding, sparse/dense container
//! encoding, and a heartbeat change-suppression optimization.

mod collectable;
mod enums;
mod frame;
mod heartbeat;
mod intern;
mod manager;
mod tree;
mod types;

pub use collectable::{
    Collectable, CollectContext, ContainerElement, DenseContainer, PrimitiveValue,
    ScalarPrimitive, ScalarStruct, SparseContainer,
};
pub use enums::{EnumDefn, EnumRegistry};
pub use frame::{CollectionFrameBuffer, UNCHANGED_SENTINEL};
pub use intern::StringInterner;
pub use manager::{CollectionManager, Frame, Timestamp};
pub use tree::{validate_path, validate_path_component, ElementNode, ElementTree};
pub use types::{FieldType, FieldValue, StructField, StructSerializer, TypeRegistry};
