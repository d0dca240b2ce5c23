//! The four observer kinds, all sharing `collect(frame)`. Collectables
//! hold read-only closures into user memory rather than raw pointers;
//! the contract is that the referenced memory outlives the owning
//! `CollectionManager`.

use crate::enums::EnumRegistry;
use crate::frame::{CollectionFrameBuffer, UNCHANGED_SENTINEL};
use crate::heartbeat::HeartbeatState;
use crate::intern::StringInterner;
use crate::types::{FieldValue, TypeRegistry};
use tracecap_error::{Error, Result};

/// A primitive scalar value, as read by a `ScalarPrimitive`'s reader
/// closure. Bool is widened to a 4-byte 0/1 on the wire.
#[derive(Debug, Clone, Copy)]
pub enum PrimitiveValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
}

impl PrimitiveValue {
    fn write(self, buf: &mut CollectionFrameBuffer) {
        match self {
            PrimitiveValue::I8(v) => buf.write_bytes(&v.to_le_bytes()),
            PrimitiveValue::U8(v) => buf.write_bytes(&v.to_le_bytes()),
            PrimitiveValue::I16(v) => buf.write_bytes(&v.to_le_bytes()),
            PrimitiveValue::U16(v) => buf.write_bytes(&v.to_le_bytes()),
            PrimitiveValue::I32(v) => buf.write_bytes(&v.to_le_bytes()),
            PrimitiveValue::U32(v) => buf.write_bytes(&v.to_le_bytes()),
            PrimitiveValue::I64(v) => buf.write_bytes(&v.to_le_bytes()),
            PrimitiveValue::U64(v) => buf.write_bytes(&v.to_le_bytes()),
            PrimitiveValue::F32(v) => buf.write_bytes(&v.to_le_bytes()),
            PrimitiveValue::F64(v) => buf.write_bytes(&v.to_le_bytes()),
            PrimitiveValue::Bool(v) => buf.write_bytes(&(v as i32).to_le_bytes()),
        }
    }
}

/// One element of a container read: `None` stands for a null/absent
/// pointer or a hand-rolled iterator's `!isValid()`.
pub type ContainerElement = Option<Vec<FieldValue>>;

/// Shared context threaded through every `collect()` call.
pub struct CollectContext<'a> {
    pub interner: &'a mut StringInterner,
    pub enums: &'a EnumRegistry,
    pub types: &'a TypeRegistry,
}

pub trait Collectable {
    fn collection_id(&self) -> u16;
    fn collect(&mut self, buf: &mut CollectionFrameBuffer, ctx: &mut CollectContext<'_>) -> Result<()>;
}

/// `ScalarPrimitive<T>`: a bound single primitive value, re-read and
/// re-emitted in full on every tick (no change suppression).
pub struct ScalarPrimitive {
    collection_id: u16,
    reader: Box<dyn Fn() -> PrimitiveValue>,
}

impl ScalarPrimitive {
    pub fn new(collection_id: u16, reader: impl Fn() -> PrimitiveValue + 'static) -> Self {
        Self {
            collection_id,
            reader: Box::new(reader),
        }
    }
}

impl Collectable for ScalarPrimitive {
    fn collection_id(&self) -> u16 {
        self.collection_id
    }

    fn collect(&mut self, buf: &mut CollectionFrameBuffer, _ctx: &mut CollectContext<'_>) -> Result<()> {
        buf.write_header(self.collection_id, 1);
        (self.reader)().write(buf);
        Ok(())
    }
}

/// `ScalarStruct<S>`: a bound single struct instance, heartbeat-gated.
pub struct ScalarStruct {
    collection_id: u16,
    struct_name: String,
    reader: Box<dyn Fn() -> Vec<FieldValue>>,
    heartbeat: HeartbeatState,
}

impl ScalarStruct {
    pub fn new(
        collection_id: u16,
        struct_name: impl Into<String>,
        heartbeat: u16,
        reader: impl Fn() -> Vec<FieldValue> + 'static,
    ) -> Self {
        Self {
            collection_id,
            struct_name: struct_name.into(),
            reader: Box::new(reader),
            heartbeat: HeartbeatState::new(heartbeat),
        }
    }
}

impl Collectable for ScalarStruct {
    fn collection_id(&self) -> u16 {
        self.collection_id
    }

    fn collect(&mut self, buf: &mut CollectionFrameBuffer, ctx: &mut CollectContext<'_>) -> Result<()> {
        let values = (self.reader)();
        let serializer = ctx.types.serializer(&self.struct_name)?;
        let mut scratch = CollectionFrameBuffer::new();
        serializer.write(&values, &mut scratch, ctx.interner, ctx.enums)?;

        if self.heartbeat.should_suppress(scratch.as_slice()) {
            buf.write_header(self.collection_id, UNCHANGED_SENTINEL);
        } else {
            buf.write_header(self.collection_id, 1);
            buf.write_bytes(scratch.as_slice());
        }
        Ok(())
    }
}

/// `DenseContainer<C of S>`: up to `capacity` struct elements, written
/// back-to-back with no bucket indices. Null elements are skipped; the
/// reported count is the number present.
pub struct DenseContainer {
    collection_id: u16,
    struct_name: String,
    capacity: u32,
    reader: Box<dyn Fn() -> Vec<ContainerElement>>,
    heartbeat: HeartbeatState,
}

impl DenseContainer {
    pub fn new(
        collection_id: u16,
        struct_name: impl Into<String>,
        capacity: u32,
        heartbeat: u16,
        reader: impl Fn() -> Vec<ContainerElement> + 'static,
    ) -> Self {
        Self {
            collection_id,
            struct_name: struct_name.into(),
            capacity,
            reader: Box::new(reader),
            heartbeat: HeartbeatState::new(heartbeat),
        }
    }
}

impl Collectable for DenseContainer {
    fn collection_id(&self) -> u16 {
        self.collection_id
    }

    fn collect(&mut self, buf: &mut CollectionFrameBuffer, ctx: &mut CollectContext<'_>) -> Result<()> {
        let elements = (self.reader)();
        if elements.len() as u32 > self.capacity {
            return Err(Error::serialization(format!(
                "dense container {} exceeds capacity {}",
                self.collection_id, self.capacity
            )));
        }
        let serializer = ctx.types.serializer(&self.struct_name)?;
        let mut scratch = CollectionFrameBuffer::new();
        let mut count = 0u16;
        for element in &elements {
            if let Some(values) = element {
                serializer.write(values, &mut scratch, ctx.interner, ctx.enums)?;
                count += 1;
            }
        }

        if self.heartbeat.should_suppress(scratch.as_slice()) {
            buf.write_header(self.collection_id, UNCHANGED_SENTINEL);
        } else {
            buf.write_header(self.collection_id, count);
            buf.write_bytes(scratch.as_slice());
        }
        Ok(())
    }
}

/// `SparseContainer<C of S>`: two-pass. First pass counts present
/// elements; second writes `(bucket_index, body)` pairs for each.
pub struct SparseContainer {
    collection_id: u16,
    struct_name: String,
    capacity: u32,
    reader: Box<dyn Fn() -> Vec<ContainerElement>>,
    heartbeat: HeartbeatState,
}

impl SparseContainer {
    pub fn new(
        collection_id: u16,
        struct_name: impl Into<String>,
        capacity: u32,
        heartbeat: u16,
        reader: impl Fn() -> Vec<ContainerElement> + 'static,
    ) -> Self {
        Self {
            collection_id,
            struct_name: struct_name.into(),
            capacity,
            reader: Box::new(reader),
            heartbeat: HeartbeatState::new(heartbeat),
        }
    }
}

impl Collectable for SparseContainer {
    fn collection_id(&self) -> u16 {
        self.collection_id
    }

    fn collect(&mut self, buf: &mut CollectionFrameBuffer, ctx: &mut CollectContext<'_>) -> Result<()> {
        let elements = (self.reader)();
        if elements.len() as u32 > self.capacity {
            return Err(Error::serialization(format!(
                "sparse container {} exceeds capacity {}",
                self.collection_id, self.capacity
            )));
        }
        let n_valid = elements.iter().filter(|e| e.is_some()).count() as u16;
        let serializer = ctx.types.serializer(&self.struct_name)?;
        let mut scratch = CollectionFrameBuffer::new();
        for (idx, element) in elements.iter().enumerate() {
            if let Some(values) = element {
                scratch.write_bucket(idx as u16);
                serializer.write(values, &mut scratch, ctx.interner, ctx.enums)?;
            }
        }

        if self.heartbeat.should_suppress(scratch.as_slice()) {
            buf.write_header(self.collection_id, UNCHANGED_SENTINEL);
        } else {
            buf.write_header(self.collection_id, n_valid);
            buf.write_bytes(scratch.as_slice());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldType, StructField};

    fn ctx_parts() -> (StringInterner, EnumRegistry, TypeRegistry) {
        (StringInterner::new(), EnumRegistry::new(), TypeRegistry::new())
    }

    #[test]
    fn scalar_primitive_s1_scenario_matches_exact_bytes() {
        let mut collectable = ScalarPrimitive::new(1, || PrimitiveValue::U32(10));
        let (mut interner, enums, types) = ctx_parts();
        let mut ctx = CollectContext {
            interner: &mut interner,
            enums: &enums,
            types: &types,
        };
        let mut buf = CollectionFrameBuffer::new();
        collectable.collect(&mut buf, &mut ctx).unwrap();
        assert_eq!(
            buf.as_slice(),
            &[0x01, 0x00, 0x01, 0x00, 0x0A, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn scalar_struct_s2_scenario_suppresses_ticks_two_through_five() {
        let mut types = TypeRegistry::new();
        types
            .register_struct(
                "Inst",
                vec![
                    StructField::new("unit", FieldType::Enum { enum_name: "Unit".into() }),
                    StructField::new("vaddr", FieldType::Int { width: 8, signed: false }),
                    StructField::new("mnemonic", FieldType::InternedString),
                ],
            )
            .unwrap();
        let mut enums = EnumRegistry::new();
        enums.register("Unit", 4, false, &[("ALU", 0), ("LSU", 1)]).unwrap();
        let mut interner = StringInterner::new();

        let mut collectable = ScalarStruct::new(2, "Inst", 5, || {
            vec![
                FieldValue::EnumLabel("ALU".into()),
                FieldValue::Int(0x1000),
                FieldValue::InternedString("ADD".into()),
            ]
        });

        let mut full_ticks = Vec::new();
        for tick in 1..=5 {
            let mut ctx = CollectContext {
                interner: &mut interner,
                enums: &enums,
                types: &types,
            };
            let mut buf = CollectionFrameBuffer::new();
            collectable.collect(&mut buf, &mut ctx).unwrap();
            let count = u16::from_le_bytes([buf.as_slice()[2], buf.as_slice()[3]]);
            if count != UNCHANGED_SENTINEL {
                full_ticks.push(tick);
            }
        }
        assert_eq!(full_ticks, vec![1]);
        assert_eq!(interner.len(), 1);
        assert_eq!(interner.text(0), Some("ADD"));
    }

    #[test]
    fn sparse_container_s3_scenario_matches_expected_counts_and_buckets() {
        let mut types = TypeRegistry::new();
        types
            .register_struct(
                "Inst",
                vec![StructField::new("mnemonic", FieldType::InternedString)],
            )
            .unwrap();
        let enums = EnumRegistry::new();
        let mut interner = StringInterner::new();

        let tick = std::cell::Cell::new(1u32);
        let mut collectable = SparseContainer::new(3, "Inst", 16, 5, move || {
            let t = tick.get();
            tick.set(t + 1);
            let mut elements: Vec<ContainerElement> = vec![None; 16];
            elements[0] = Some(vec![FieldValue::InternedString("ADD".into())]);
            elements[2] = Some(vec![FieldValue::InternedString("MOV".into())]);
            if t >= 7 {
                elements[5] = Some(vec![FieldValue::InternedString("SUB".into())]);
            }
            elements
        });

        let mut counts = Vec::new();
        let mut last_body_buckets = Vec::new();
        for t in 1..=7 {
            let mut ctx = CollectContext {
                interner: &mut interner,
                enums: &enums,
                types: &types,
            };
            let mut buf = CollectionFrameBuffer::new();
            collectable.collect(&mut buf, &mut ctx).unwrap();
            let count = u16::from_le_bytes([buf.as_slice()[2], buf.as_slice()[3]]);
            counts.push(count);
            if t == 7 {
                let body = &buf.as_slice()[4..];
                let mut offset = 0;
                while offset < body.len() {
                    last_body_buckets.push(u16::from_le_bytes([body[offset], body[offset + 1]]));
                    offset += 2 + 4; // bucket index + interned-string-id width
                }
            }
        }
        assert_eq!(
            counts,
            vec![2, UNCHANGED_SENTINEL, UNCHANGED_SENTINEL, UNCHANGED_SENTINEL, UNCHANGED_SENTINEL, UNCHANGED_SENTINEL, 3]
        );
        assert_eq!(last_body_buckets, vec![0, 2, 5]);
    }
}
