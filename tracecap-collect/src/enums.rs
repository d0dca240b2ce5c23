//! Per-enum-type name→underlying-int registry. Each enum type is
//! registered once, ahead of any struct that references it;
//! `StructSerializer` consults this to turn a label into the bytes it
//! writes for an enum field.

use std::collections::HashMap;
use tracecap_error::{Error, Result};

#[derive(Debug, Clone)]
pub struct EnumDefn {
    pub width: u8,
    pub signed: bool,
    /// label -> underlying integer value, insertion order preserved for
    /// deterministic metadata emission.
    pub variants: Vec<(String, i64)>,
    by_label: HashMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct EnumRegistry {
    enums: HashMap<String, EnumDefn>,
}

impl EnumRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `enum_name` with its underlying integer width and
    /// `label -> value` variants. Fails if the name is already
    /// registered (one-shot registration per enum type).
    pub fn register(
        &mut self,
        enum_name: &str,
        width: u8,
        signed: bool,
        variants: &[(&str, i64)],
    ) -> Result<()> {
        if self.enums.contains_key(enum_name) {
            return Err(Error::schema(format!(
                "enum '{enum_name}' is already registered"
            )));
        }
        let owned: Vec<(String, i64)> = variants
            .iter()
            .map(|(label, value)| (label.to_string(), *value))
            .collect();
        let by_label = owned.iter().cloned().collect();
        self.enums.insert(
            enum_name.to_string(),
            EnumDefn {
                width,
                signed,
                variants: owned,
                by_label,
            },
        );
        Ok(())
    }

    pub fn get(&self, enum_name: &str) -> Option<&EnumDefn> {
        self.enums.get(enum_name)
    }

    /// Resolves `label`'s underlying integer value for `enum_name`.
    pub fn underlying_value(&self, enum_name: &str, label: &str) -> Result<i64> {
        let defn = self
            .enums
            .get(enum_name)
            .ok_or_else(|| Error::serialization(format!("unknown enum type '{enum_name}'")))?;
        defn.by_label
            .get(label)
            .copied()
            .ok_or_else(|| Error::serialization(format!("unknown enum label '{enum_name}::{label}'")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EnumDefn)> {
        self.enums.iter().map(|(name, defn)| (name.as_str(), defn))
    }
}
