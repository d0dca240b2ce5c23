//! Data-driven per-field typing. A [`TypeRegistry`] holds one ordered
//! field list per struct type; [`StructSerializer`] is a plain
//! interpreter over that list, writing each field at its declared fixed
//! width with no padding.

use crate::enums::EnumRegistry;
use crate::frame::CollectionFrameBuffer;
use crate::intern::StringInterner;
use std::collections::HashMap;
use tracecap_error::{Error, Result};

/// The wire-level shape of one struct field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Int { width: u8, signed: bool },
    Float,
    Double,
    FixedChar { width: u8 },
    /// Serialized as the enum's underlying integer.
    Enum { enum_name: String },
    /// Serialized as the u32 interned string id.
    InternedString,
    /// Same wire format as `Int`; the hex-ness is display metadata only.
    HexInt { width: u8, signed: bool },
}

impl FieldType {
    /// Width in bytes of this field on the wire.
    pub fn width(&self, enums: &EnumRegistry) -> Result<u8> {
        Ok(match self {
            FieldType::Int { width, .. } | FieldType::HexInt { width, .. } => *width,
            FieldType::Float => 4,
            FieldType::Double => 8,
            FieldType::FixedChar { width } => *width,
            FieldType::InternedString => 4,
            FieldType::Enum { enum_name } => {
                enums
                    .get(enum_name)
                    .ok_or_else(|| {
                        Error::serialization(format!("unknown enum type '{enum_name}'"))
                    })?
                    .width
            }
        })
    }

    /// The `field_type`/`format_code` pair recorded in `StructFields`.
    pub fn format_code(&self) -> &'static str {
        match self {
            FieldType::Int { .. } => "int",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::FixedChar { .. } => "char",
            FieldType::Enum { .. } => "enum",
            FieldType::InternedString => "string",
            FieldType::HexInt { .. } => "hex",
        }
    }
}

/// One field's declared slot inside a struct, in registration order.
#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub field_type: FieldType,
    pub is_color_key: bool,
    pub visible_by_default: bool,
}

impl StructField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            is_color_key: false,
            visible_by_default: true,
        }
    }

    pub fn color_key(mut self) -> Self {
        self.is_color_key = true;
        self
    }

    pub fn hidden_by_default(mut self) -> Self {
        self.visible_by_default = false;
        self
    }
}

/// A single field's runtime value, supplied by the caller at `collect()`
/// time and checked against the declared [`FieldType`].
#[derive(Debug, Clone)]
pub enum FieldValue {
    Int(i64),
    Float(f32),
    Double(f64),
    FixedChar(String),
    EnumLabel(String),
    InternedString(String),
}

/// Per-struct-type field list, keyed by struct name.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    structs: HashMap<String, Vec<StructField>>,
    order: Vec<String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `struct_name`'s ordered field list. Fails if the name is
    /// already registered.
    pub fn register_struct(&mut self, struct_name: &str, fields: Vec<StructField>) -> Result<()> {
        if self.structs.contains_key(struct_name) {
            return Err(Error::schema(format!(
                "struct '{struct_name}' is already registered"
            )));
        }
        self.order.push(struct_name.to_string());
        self.structs.insert(struct_name.to_string(), fields);
        Ok(())
    }

    pub fn fields(&self, struct_name: &str) -> Option<&[StructField]> {
        self.structs.get(struct_name).map(Vec::as_slice)
    }

    /// Total byte width of one instance of `struct_name`.
    pub fn instance_width(&self, struct_name: &str, enums: &EnumRegistry) -> Result<u32> {
        let fields = self
            .fields(struct_name)
            .ok_or_else(|| Error::schema(format!("unknown struct '{struct_name}'")))?;
        let mut total = 0u32;
        for field in fields {
            total += u32::from(field.field_type.width(enums)?);
        }
        Ok(total)
    }

    /// Structs in registration order, for deterministic metadata
    /// emission.
    pub fn registered_structs(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn serializer<'r>(&'r self, struct_name: &str) -> Result<StructSerializer<'r>> {
        let fields = self
            .fields(struct_name)
            .ok_or_else(|| Error::schema(format!("unknown struct '{struct_name}'")))?;
        Ok(StructSerializer {
            struct_name: struct_name.to_string(),
            fields,
        })
    }
}

/// Writes one instance of a struct's declared fields, in order, each at
/// its fixed declared width. Never touches bytes outside the declared
/// fields: no padding, no alignment holes.
pub struct StructSerializer<'r> {
    struct_name: String,
    fields: &'r [StructField],
}

impl<'r> StructSerializer<'r> {
    pub fn write(
        &self,
        values: &[FieldValue],
        buf: &mut CollectionFrameBuffer,
        interner: &mut StringInterner,
        enums: &EnumRegistry,
    ) -> Result<()> {
        if values.len() != self.fields.len() {
            return Err(Error::serialization(format!(
                "struct '{}' expects {} fields, got {}",
                self.struct_name,
                self.fields.len(),
                values.len()
            )));
        }
        for (field, value) in self.fields.iter().zip(values) {
            write_field(&self.struct_name, field, value, buf, interner, enums)?;
        }
        Ok(())
    }
}

fn write_field(
    struct_name: &str,
    field: &StructField,
    value: &FieldValue,
    buf: &mut CollectionFrameBuffer,
    interner: &mut StringInterner,
    enums: &EnumRegistry,
) -> Result<()> {
    let mismatch = || {
        Error::serialization(format!(
            "{struct_name}.{}: value does not match declared field type {:?}",
            field.name, field.field_type
        ))
    };

    match (&field.field_type, value) {
        (FieldType::Int { width, .. }, FieldValue::Int(v))
        | (FieldType::HexInt { width, .. }, FieldValue::Int(v)) => {
            write_int(buf, *v, *width);
            Ok(())
        }
        (FieldType::Float, FieldValue::Float(v)) => {
            buf.write_bytes(&v.to_le_bytes());
            Ok(())
        }
        (FieldType::Double, FieldValue::Double(v)) => {
            buf.write_bytes(&v.to_le_bytes());
            Ok(())
        }
        (FieldType::FixedChar { width }, FieldValue::FixedChar(s)) => {
            write_fixed_char(buf, s, *width);
            Ok(())
        }
        (FieldType::Enum { enum_name }, FieldValue::EnumLabel(label)) => {
            let defn = enums
                .get(enum_name)
                .ok_or_else(|| Error::serialization(format!("unknown enum type '{enum_name}'")))?;
            let underlying = enums.underlying_value(enum_name, label)?;
            write_int(buf, underlying, defn.width);
            Ok(())
        }
        (FieldType::InternedString, FieldValue::InternedString(s)) => {
            let id = interner.intern(s);
            buf.write_bytes(&id.to_le_bytes());
            Ok(())
        }
        _ => Err(mismatch()),
    }
}

fn write_int(buf: &mut CollectionFrameBuffer, value: i64, width: u8) {
    let bytes = value.to_le_bytes();
    buf.write_bytes(&bytes[..width as usize]);
}

fn write_fixed_char(buf: &mut CollectionFrameBuffer, s: &str, width: u8) {
    let mut bytes = vec![0u8; width as usize];
    let src = s.as_bytes();
    let n = src.len().min(width as usize);
    bytes[..n].copy_from_slice(&src[..n]);
    buf.write_bytes(&bytes);
}
