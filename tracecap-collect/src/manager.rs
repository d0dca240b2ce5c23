//! Owns all Collectables, the monotonic timestamp source, the
//! element-path tree, and the heartbeat value; orchestrates one tick.

use crate::collectable::{Collectable, CollectContext};
use crate::enums::EnumRegistry;
use crate::frame::CollectionFrameBuffer;
use crate::intern::StringInterner;
use crate::tree::ElementTree;
use crate::types::{StructField, TypeRegistry};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracecap_error::{Error, Result};
use tracecap_schema::TimeType;
use tracecap_store::{StoreFacade, Value};

/// The wire representation of one `collect()` call's timestamp; mirrors
/// the clock types `CollectionGlobals.time_type` can record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timestamp {
    Int(i64),
    Real(f64),
}

impl Timestamp {
    fn is_strictly_after(self, previous: Timestamp) -> bool {
        match (self, previous) {
            (Timestamp::Int(a), Timestamp::Int(b)) => a > b,
            (Timestamp::Real(a), Timestamp::Real(b)) => a > b,
            (Timestamp::Int(a), Timestamp::Real(b)) => (a as f64) > b,
            (Timestamp::Real(a), Timestamp::Int(b)) => a > (b as f64),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Timestamp::Int(v) => v as f64,
            Timestamp::Real(v) => v,
        }
    }

    pub fn time_type(self) -> TimeType {
        match self {
            Timestamp::Int(_) => TimeType::Int,
            Timestamp::Real(_) => TimeType::Real,
        }
    }
}

/// One tick's packed frame, ready to hand to the pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: Timestamp,
    pub bytes: Vec<u8>,
}

struct CollectionRecord {
    name: String,
    path: String,
    data_type: String,
    is_container: bool,
    is_sparse: bool,
    capacity: u32,
    clock_id: Option<u32>,
}

struct ClockRecord {
    name: String,
    period: u32,
}

pub struct CollectionManager {
    heartbeat: u16,
    collectables: Vec<Box<dyn Collectable>>,
    collections: Vec<CollectionRecord>,
    clocks: Vec<ClockRecord>,
    names: HashSet<String>,
    tree: ElementTree,
    /// Shared so the pipeline's commit thread can drain newly interned
    /// strings while `collect()` keeps interning on the producer thread;
    /// a mutex rather than single-thread confinement since both sides
    /// touch it concurrently.
    interner: Arc<Mutex<StringInterner>>,
    enums: EnumRegistry,
    types: TypeRegistry,
    last_timestamp: Option<Timestamp>,
    frozen: bool,
}

impl CollectionManager {
    pub fn new(heartbeat: u16) -> Self {
        Self {
            heartbeat,
            collectables: Vec::new(),
            collections: Vec::new(),
            clocks: Vec::new(),
            names: HashSet::new(),
            tree: ElementTree::new(),
            interner: Arc::new(Mutex::new(StringInterner::new())),
            enums: EnumRegistry::new(),
            types: TypeRegistry::new(),
            last_timestamp: None,
            frozen: false,
        }
    }

    pub fn heartbeat(&self) -> u16 {
        self.heartbeat
    }

    pub fn enum_registry_mut(&mut self) -> &mut EnumRegistry {
        &mut self.enums
    }

    pub fn type_registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    pub fn register_struct(&mut self, struct_name: &str, fields: Vec<StructField>) -> Result<()> {
        self.types.register_struct(struct_name, fields)
    }

    pub fn register_enum(
        &mut self,
        enum_name: &str,
        width: u8,
        signed: bool,
        variants: &[(&str, i64)],
    ) -> Result<()> {
        self.enums.register(enum_name, width, signed, variants)
    }

    pub fn add_clock(&mut self, name: &str, period: u32) -> Result<u32> {
        if self.frozen {
            return Err(Error::configuration("cannot add a clock after finalize"));
        }
        let id = self.clocks.len() as u32;
        self.clocks.push(ClockRecord {
            name: name.to_string(),
            period,
        });
        Ok(id)
    }

    /// Registers a collection. `clock` names a clock already registered
    /// via `add_clock`, recording which sampling domain drives this
    /// collection's leaf in `ElementTreeNodes.clock_id`; `None` if the
    /// collection isn't tied to a particular clock. `build` receives the
    /// collection's assigned dense id (1-based, matching the S1
    /// scenario's `collection_id=1` for the first registered collection)
    /// and must construct the matching `Collectable`.
    pub fn add_collection(
        &mut self,
        name: &str,
        path: &str,
        data_type: &str,
        is_container: bool,
        is_sparse: bool,
        capacity: u32,
        clock: Option<&str>,
        build: impl FnOnce(u16) -> Box<dyn Collectable>,
    ) -> Result<u16> {
        if self.frozen {
            return Err(Error::configuration(
                "cannot add a collection after finalize",
            ));
        }
        if !self.names.insert(name.to_string()) {
            return Err(Error::configuration(format!(
                "collection name '{name}' already registered"
            )));
        }
        self.tree.add_path(path)?;

        let clock_id = match clock {
            Some(clock_name) => Some(
                self.clocks
                    .iter()
                    .position(|c| c.name == clock_name)
                    .ok_or_else(|| {
                        Error::configuration(format!("unknown clock '{clock_name}'"))
                    })? as u32,
            ),
            None => None,
        };

        let id = (self.collections.len() + 1) as u16;
        self.collections.push(CollectionRecord {
            name: name.to_string(),
            path: path.to_string(),
            data_type: data_type.to_string(),
            is_container,
            is_sparse,
            capacity,
            clock_id,
        });
        self.collectables.push(build(id));
        Ok(id)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Writes one row per Collection, ElementNode, Clock, struct field,
    /// and enum definition, then enters the frozen state.
    pub fn finalize(&mut self, facade: &StoreFacade) -> Result<()> {
        if self.frozen {
            return Err(Error::configuration("already finalized"));
        }

        facade.safe_transaction(|tx| {
            for (i, collection) in self.collections.iter().enumerate() {
                tx.insert(
                    "Collections",
                    &["id", "name", "data_type", "is_container", "is_sparse", "capacity"],
                    &[
                        Value::U32((i + 1) as u32),
                        Value::Text(collection.name.clone()),
                        Value::Text(collection.data_type.clone()),
                        Value::I32(collection.is_container as i32),
                        Value::I32(collection.is_sparse as i32),
                        Value::U32(collection.capacity),
                    ],
                )?;
            }

            for (i, clock) in self.clocks.iter().enumerate() {
                tx.insert(
                    "Clocks",
                    &["id", "name", "period"],
                    &[
                        Value::U32(i as u32),
                        Value::Text(clock.name.clone()),
                        Value::U32(clock.period),
                    ],
                )?;
            }

            let paths = self.tree.paths();
            let collections_by_path: std::collections::HashMap<String, (i64, i64)> = paths
                .iter()
                .enumerate()
                .map(|(i, p)| (p.clone(), ((i + 1) as i64, 0i64)))
                .collect();
            let clocks_by_path: std::collections::HashMap<String, i64> = self
                .collections
                .iter()
                .filter_map(|c| c.clock_id.map(|id| (c.path.clone(), i64::from(id))))
                .collect();
            let nodes = self.tree.build(
                &clocks_by_path,
                &collections_by_path,
                &std::collections::HashMap::new(),
            );
            for node in &nodes {
                tx.insert(
                    "ElementTreeNodes",
                    &["id", "name", "parent_id", "clock_id", "collection_id", "offset", "widget_hint"],
                    &[
                        Value::U32(node.id),
                        Value::Text(node.name.clone()),
                        node.parent_id.map(|p| Value::I64(i64::from(p))).unwrap_or(Value::Null),
                        node.clock_id.map(Value::I64).unwrap_or(Value::Null),
                        node.collection_id.map(Value::I64).unwrap_or(Value::Null),
                        node.offset.map(Value::I64).unwrap_or(Value::Null),
                        node.widget_hint.clone().map(Value::Text).unwrap_or(Value::Null),
                    ],
                )?;
            }

            let mut emitted_enums = HashSet::new();
            for struct_name in self.types.registered_structs() {
                let fields = self.types.fields(struct_name).unwrap_or(&[]);
                for field in fields {
                    tx.insert(
                        "StructFields",
                        &[
                            "struct_name",
                            "field_name",
                            "field_type",
                            "format_code",
                            "is_color_key",
                            "visible_by_default",
                        ],
                        &[
                            Value::Text(struct_name.to_string()),
                            Value::Text(field.name.clone()),
                            Value::Text(format!("{:?}", field.field_type)),
                            Value::Text(field.field_type.format_code().to_string()),
                            Value::I32(field.is_color_key as i32),
                            Value::I32(field.visible_by_default as i32),
                        ],
                    )?;

                    if let crate::types::FieldType::Enum { enum_name } = &field.field_type {
                        if emitted_enums.insert(enum_name.clone()) {
                            if let Some(defn) = self.enums.get(enum_name) {
                                for (label, value) in &defn.variants {
                                    tx.insert(
                                        "EnumDefns",
                                        &["enum_name", "label", "value_blob", "underlying_type"],
                                        &[
                                            Value::Text(enum_name.clone()),
                                            Value::Text(label.clone()),
                                            Value::Blob(value.to_le_bytes()[..defn.width as usize].to_vec()),
                                            Value::Text(if defn.signed { "i" } else { "u" }.to_string()),
                                        ],
                                    )?;
                                }
                            }
                        }
                    }
                }
            }

            Ok(())
        })?;

        self.frozen = true;
        Ok(())
    }

    /// Builds a single frame by invoking every collectable in
    /// registration order; requires a strictly increasing timestamp
    /// relative to the previous call.
    pub fn collect(&mut self, timestamp: Timestamp) -> Result<Frame> {
        if !self.frozen {
            return Err(Error::configuration("collect() called before finalize()"));
        }
        if let Some(previous) = self.last_timestamp {
            if !timestamp.is_strictly_after(previous) {
                return Err(Error::time_regression(
                    format!("{previous:?}"),
                    format!("{timestamp:?}"),
                ));
            }
        }

        let mut buf = CollectionFrameBuffer::new();
        let CollectionManager {
            collectables,
            interner,
            enums,
            types,
            ..
        } = self;
        let mut interner_guard = interner.lock();
        let mut ctx = CollectContext {
            interner: &mut interner_guard,
            enums,
            types,
        };
        for collectable in collectables.iter_mut() {
            collectable.collect(&mut buf, &mut ctx)?;
        }
        drop(interner_guard);

        self.last_timestamp = Some(timestamp);
        Ok(Frame {
            timestamp,
            bytes: buf.into_bytes(),
        })
    }

    /// Entries interned since the last drain, ready to be written to
    /// `StringMap` by the pipeline's commit step.
    pub fn drain_new_interned_strings(&mut self) -> Vec<(u32, String)> {
        self.interner.lock().drain_new()
    }

    /// A shared handle the caller can move into the pipeline's
    /// `StringDrain` callback so the commit thread can drain new strings
    /// without this crate depending on `tracecap-pipeline`.
    pub fn interner_handle(&self) -> Arc<Mutex<StringInterner>> {
        Arc::clone(&self.interner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectable::{PrimitiveValue, ScalarPrimitive};
    use tracecap_schema::{core_schema, TimeType as SchemaTimeType};

    #[test]
    fn add_collection_rejects_duplicate_names_and_paths() {
        let mut manager = CollectionManager::new(5);
        manager
            .add_collection("C1", "stats.count", "u32", false, false, 1, None, |id| {
                Box::new(ScalarPrimitive::new(id, || PrimitiveValue::U32(1)))
            })
            .unwrap();
        let dup_name = manager.add_collection("C1", "stats.other", "u32", false, false, 1, None, |id| {
            Box::new(ScalarPrimitive::new(id, || PrimitiveValue::U32(1)))
        });
        assert!(dup_name.is_err());
        let dup_path = manager.add_collection("C2", "stats.count", "u32", false, false, 1, None, |id| {
            Box::new(ScalarPrimitive::new(id, || PrimitiveValue::U32(1)))
        });
        assert!(dup_path.is_err());
    }

    #[test]
    fn collect_before_finalize_fails() {
        let mut manager = CollectionManager::new(5);
        manager
            .add_collection("C1", "stats.count", "u32", false, false, 1, None, |id| {
                Box::new(ScalarPrimitive::new(id, || PrimitiveValue::U32(1)))
            })
            .unwrap();
        assert!(manager.collect(Timestamp::Int(1)).is_err());
    }

    #[test]
    fn collect_enforces_strictly_monotonic_timestamps() {
        let facade = StoreFacade::open_in_memory().unwrap();
        facade
            .apply_schema(&core_schema(5, SchemaTimeType::Int).unwrap())
            .unwrap();
        let mut manager = CollectionManager::new(5);
        manager
            .add_collection("C1", "stats.count", "u32", false, false, 1, None, |id| {
                Box::new(ScalarPrimitive::new(id, || PrimitiveValue::U32(1)))
            })
            .unwrap();
        manager.finalize(&facade).unwrap();

        manager.collect(Timestamp::Int(1)).unwrap();
        manager.collect(Timestamp::Int(2)).unwrap();
        let regression = manager.collect(Timestamp::Int(2));
        assert!(regression.is_err());
        let regression2 = manager.collect(Timestamp::Int(1));
        assert!(regression2.is_err());
    }

    #[test]
    fn s1_scalar_counter_scenario_matches_exact_bytes_across_three_ticks() {
        let facade = StoreFacade::open_in_memory().unwrap();
        facade
            .apply_schema(&core_schema(5, SchemaTimeType::Int).unwrap())
            .unwrap();
        let mut manager = CollectionManager::new(5);
        let values = [10u32, 20, 30];
        let idx = std::cell::Cell::new(0usize);
        manager
            .add_collection("C1", "stats.count", "u32", false, false, 1, None, |id| {
                Box::new(ScalarPrimitive::new(id, move || {
                    let v = values[idx.get()];
                    idx.set((idx.get() + 1).min(values.len() - 1));
                    PrimitiveValue::U32(v)
                }))
            })
            .unwrap();
        manager.finalize(&facade).unwrap();

        let expected = [
            vec![0x01, 0x00, 0x01, 0x00, 0x0A, 0x00, 0x00, 0x00],
            vec![0x01, 0x00, 0x01, 0x00, 0x14, 0x00, 0x00, 0x00],
            vec![0x01, 0x00, 0x01, 0x00, 0x1E, 0x00, 0x00, 0x00],
        ];
        for (i, ts) in [1i64, 2, 3].into_iter().enumerate() {
            let frame = manager.collect(Timestamp::Int(ts)).unwrap();
            assert_eq!(frame.bytes, expected[i]);
        }
    }
}
