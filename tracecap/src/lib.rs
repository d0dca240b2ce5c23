//! Top-level façade wiring [`tracecap_collect::CollectionManager`],
//! [`tracecap_pipeline::Pipeline`], and [`tracecap_store::StoreFacade`]
//! into a single entry point: [`CaptureEngine`].
//!
//! An embedding simulator registers its collections against the engine,
//! calls [`CaptureEngine::finalize`] once all registration is done, then
//! calls [`CaptureEngine::collect`] once per sampling tick. Everything
//! downstream — compression, commit ordering, back-pressure — is the
//! pipeline's concern; the engine just hands it each tick's frame.

pub mod config;

use std::sync::Arc;

use parking_lot::Mutex;
use tracecap_collect::{
    Collectable, CollectionManager, ContainerElement, DenseContainer, PrimitiveValue,
    ScalarPrimitive, ScalarStruct, SparseContainer, StructField,
};
use tracecap_error::Result;
use tracecap_pipeline::{Pipeline, StringDrain};
use tracecap_schema::core_schema;
use tracecap_store::{StoreFacade, Value};

pub use config::{ClockConfig, CompressionConfig, EngineConfig, StoreConfig, TimeKind};
pub use tracecap_collect::Timestamp;

/// The capture engine: owns the store, the collection manager, and the
/// compress-and-commit pipeline for one trace file.
///
/// Registration (`register_struct`, `register_enum`, `add_collection`,
/// `add_clock`) happens on the producer thread before [`Self::finalize`];
/// afterwards only [`Self::collect`] and [`Self::teardown`] are called.
pub struct CaptureEngine {
    facade: Arc<StoreFacade>,
    manager: Mutex<CollectionManager>,
    pipeline: Pipeline,
}

impl CaptureEngine {
    /// Opens (or creates) the backing store at `store.path`, applies the
    /// built-in schema if this is a fresh file (the schema is immutable on
    /// a pre-existing file, so an engine re-opening a trace from a prior
    /// run skips `apply_schema` entirely rather than letting it fail), and
    /// starts the pipeline's background workers.
    pub fn open(store: StoreConfig, engine: EngineConfig) -> Result<Self> {
        let facade = StoreFacade::open(&store.path, store.force_new)?;
        Self::from_facade(facade, engine)
    }

    /// Like [`Self::open`], but against an in-memory store; used by
    /// tests and by embedders that don't want a trace file on disk.
    pub fn open_in_memory(engine: EngineConfig) -> Result<Self> {
        let facade = StoreFacade::open_in_memory()?;
        Self::from_facade(facade, engine)
    }

    fn from_facade(facade: Arc<StoreFacade>, engine: EngineConfig) -> Result<Self> {
        if facade.is_new() {
            let schema = core_schema(engine.heartbeat, engine.time_kind.to_schema_time_type())?;
            facade.apply_schema(&schema)?;
            // `CollectionGlobals` carries exactly one row recording the
            // chosen heartbeat and timestamp wire type; an empty-column
            // insert lets both columns fall back to the defaults baked
            // into the schema by `core_schema` above.
            facade.safe_transaction(|tx| {
                tx.conn()
                    .execute_batch("INSERT INTO CollectionGlobals DEFAULT VALUES")
                    .map_err(|e| {
                        tracecap_error::Error::engine(
                            "INSERT INTO CollectionGlobals DEFAULT VALUES",
                            e.to_string(),
                        )
                    })
            })?;
        }

        let mut manager = CollectionManager::new(engine.heartbeat);
        for clock in &engine.clocks {
            manager.add_clock(&clock.name, clock.period)?;
        }

        let interner = manager.interner_handle();
        let string_drain: Arc<StringDrain> = Arc::new(move || interner.lock().drain_new());
        let pipeline = Pipeline::new(
            Arc::clone(&facade),
            engine.compression.high_water_mark,
            engine.compression.stage_a_level,
            engine.compression.stage_b_level,
            string_drain,
        );

        Ok(Self {
            facade,
            manager: Mutex::new(manager),
            pipeline,
        })
    }

    /// Registers a struct type's ordered field list. Must happen before
    /// any collection referencing this struct is added.
    pub fn register_struct(&self, struct_name: &str, fields: Vec<StructField>) -> Result<()> {
        self.manager.lock().register_struct(struct_name, fields)
    }

    /// Registers an enum type's label→underlying-int mapping. Must happen
    /// before any struct field referencing this enum is registered.
    pub fn register_enum(
        &self,
        enum_name: &str,
        width: u8,
        signed: bool,
        variants: &[(&str, i64)],
    ) -> Result<()> {
        self.manager
            .lock()
            .register_enum(enum_name, width, signed, variants)
    }

    /// Registers a named sampling domain; returns its dense id.
    pub fn add_clock(&self, name: &str, period: u32) -> Result<u32> {
        self.manager.lock().add_clock(name, period)
    }

    /// Registers a scalar-of-primitive collection: reads a fresh
    /// [`PrimitiveValue`] from `reader` on every tick. `clock` names a
    /// clock already registered via [`Self::add_clock`], recording which
    /// sampling domain drives this collection; `None` if it isn't tied
    /// to one.
    pub fn add_scalar_primitive(
        &self,
        name: &str,
        path: &str,
        data_type: &str,
        clock: Option<&str>,
        reader: impl Fn() -> PrimitiveValue + 'static,
    ) -> Result<u16> {
        self.manager.lock().add_collection(
            name,
            path,
            data_type,
            false,
            false,
            1,
            clock,
            move |id| -> Box<dyn Collectable> { Box::new(ScalarPrimitive::new(id, reader)) },
        )
    }

    /// Registers a scalar-of-struct collection, heartbeat-gated: unchanged
    /// instances since the last emitted frame are suppressed to a
    /// sentinel count.
    pub fn add_scalar_struct(
        &self,
        name: &str,
        path: &str,
        struct_name: &str,
        clock: Option<&str>,
        reader: impl Fn() -> Vec<tracecap_collect::FieldValue> + 'static,
    ) -> Result<u16> {
        let heartbeat = self.manager.lock().heartbeat();
        let struct_name_owned = struct_name.to_string();
        self.manager.lock().add_collection(
            name,
            path,
            struct_name,
            false,
            false,
            1,
            clock,
            move |id| -> Box<dyn Collectable> {
                Box::new(ScalarStruct::new(
                    id,
                    struct_name_owned,
                    heartbeat,
                    reader,
                ))
            },
        )
    }

    /// Registers a dense container collection: up to `capacity` struct
    /// elements, absent ones skipped, no bucket indices on the wire.
    pub fn add_dense_container(
        &self,
        name: &str,
        path: &str,
        struct_name: &str,
        capacity: u32,
        clock: Option<&str>,
        reader: impl Fn() -> Vec<ContainerElement> + 'static,
    ) -> Result<u16> {
        let heartbeat = self.manager.lock().heartbeat();
        let struct_name_owned = struct_name.to_string();
        self.manager.lock().add_collection(
            name,
            path,
            struct_name,
            true,
            false,
            capacity,
            clock,
            move |id| -> Box<dyn Collectable> {
                Box::new(DenseContainer::new(
                    id,
                    struct_name_owned,
                    capacity,
                    heartbeat,
                    reader,
                ))
            },
        )
    }

    /// Registers a sparse container collection: `(bucket_index, body)`
    /// pairs for each present element.
    pub fn add_sparse_container(
        &self,
        name: &str,
        path: &str,
        struct_name: &str,
        capacity: u32,
        clock: Option<&str>,
        reader: impl Fn() -> Vec<ContainerElement> + 'static,
    ) -> Result<u16> {
        let heartbeat = self.manager.lock().heartbeat();
        let struct_name_owned = struct_name.to_string();
        self.manager.lock().add_collection(
            name,
            path,
            struct_name,
            true,
            true,
            capacity,
            clock,
            move |id| -> Box<dyn Collectable> {
                Box::new(SparseContainer::new(
                    id,
                    struct_name_owned,
                    capacity,
                    heartbeat,
                    reader,
                ))
            },
        )
    }

    /// Writes Collection/ElementNode/Clock/struct-field/enum metadata and
    /// freezes the manager against further registration.
    pub fn finalize(&self) -> Result<()> {
        self.manager.lock().finalize(&self.facade)
    }

    /// Runs one tick: invokes every collectable in registration order and
    /// hands the resulting frame to the pipeline. Fails with
    /// `TimeRegressionError` if `timestamp` does not strictly increase
    /// over the previous call.
    pub fn collect(&self, timestamp: Timestamp) -> Result<()> {
        let frame = self.manager.lock().collect(timestamp)?;
        self.pipeline.push(frame.bytes, Value::F64(frame.timestamp.as_f64()));
        Ok(())
    }

    /// A read-only snapshot of the pipeline's per-stage load-balancer
    /// state.
    pub fn stage_stats(&self, stage: tracecap_pipeline::Stage) -> tracecap_pipeline::StageStats {
        self.pipeline.stage_stats(stage)
    }

    /// Drains both pipeline stages, flushes any remaining frames, and
    /// stops the out-of-band task queue. Called automatically on drop.
    pub fn teardown(&self) -> Result<()> {
        self.pipeline.teardown()
    }

    /// Direct access to the underlying store, for callers that need to
    /// run ad hoc queries against a live trace (e.g. a co-located
    /// diagnostics hook); out-of-band writes should still go through
    /// `safe_transaction` like everything else.
    pub fn store(&self) -> &StoreFacade {
        &self.facade
    }
}
