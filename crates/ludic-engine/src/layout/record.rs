//! Record descriptions and C layout computation
//!
//! Host records are described as ordered slots; offsets follow C rules for
//! the configured pointer width. Conditional slots that are absent from the
//! build take no space.

use crate::config::{BuildConfig, LayoutFeature};

use super::{FieldDescriptor, NativeType};

/// Element count of an inline array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLen {
    /// Exactly this many elements
    Fixed(u32),
    /// As many elements as fit in this many pointer-sized words
    Words(u32),
}

/// One slot of a record
#[derive(Debug, Clone, Copy)]
pub enum Slot {
    /// Scalar or pointer member
    Field(&'static str, NativeType),
    /// Inline array; registered at the offset of its first element
    Array(&'static str, NativeType, ArrayLen),
    /// Nested struct; an empty name embeds the members without a prefix
    Embed(&'static str, &'static [Slot]),
    /// Union; every inner slot is one variant at the same offset
    Union(&'static str, &'static [Slot]),
    /// Slot present only when the build has the feature
    When(LayoutFeature, &'static Slot),
}

/// A host record
#[derive(Debug, Clone, Copy)]
pub struct RecordDef {
    /// Record name as the translator spells it
    pub name: &'static str,
    /// Whole record exists only with this feature
    pub requires: Option<LayoutFeature>,
    /// Members in declaration order
    pub slots: &'static [Slot],
}

/// Computed layout of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    /// Record name
    pub name: &'static str,
    /// `sizeof`
    pub size: u32,
    /// Members by dotted name
    pub fields: Vec<(String, FieldDescriptor)>,
}

fn align_up(n: u32, align: u32) -> u32 {
    n.div_ceil(align) * align
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl Slot {
    /// `(size, align)` of the slot in this build, or `None` if absent
    fn measure(&self, config: &BuildConfig) -> Option<(u32, u32)> {
        let width = config.pointer_width;
        match *self {
            Slot::Field(_, ty) => Some((ty.size(width), ty.align(width))),
            Slot::Array(_, ty, len) => {
                let count = match len {
                    ArrayLen::Fixed(n) => n,
                    ArrayLen::Words(n) => n * width.bytes() as u32 / ty.size(width),
                };
                Some((ty.size(width) * count, ty.align(width)))
            }
            Slot::Embed(_, slots) => Some(measure_struct(slots, config)),
            Slot::Union(_, variants) => {
                let (size, align) = variants
                    .iter()
                    .filter_map(|v| v.measure(config))
                    .fold((0, 1), |(s, a), (vs, va)| (s.max(vs), a.max(va)));
                Some((align_up(size, align), align))
            }
            Slot::When(feature, slot) => {
                if config.has(feature) {
                    slot.measure(config)
                } else {
                    None
                }
            }
        }
    }

    fn place(
        &self,
        prefix: &str,
        offset: u32,
        config: &BuildConfig,
        out: &mut Vec<(String, FieldDescriptor)>,
    ) {
        match *self {
            Slot::Field(name, native_type) | Slot::Array(name, native_type, _) => {
                out.push((join(prefix, name), FieldDescriptor { offset, native_type }));
            }
            Slot::Embed(name, slots) => {
                let inner = if name.is_empty() { prefix.to_string() } else { join(prefix, name) };
                place_struct(slots, &inner, offset, config, out);
            }
            Slot::Union(name, variants) => {
                let inner = join(prefix, name);
                for variant in variants {
                    variant.place(&inner, offset, config, out);
                }
            }
            Slot::When(feature, slot) => {
                if config.has(feature) {
                    slot.place(prefix, offset, config, out);
                }
            }
        }
    }
}

fn measure_struct(slots: &[Slot], config: &BuildConfig) -> (u32, u32) {
    let mut cursor = 0;
    let mut max_align = 1;
    for (size, align) in slots.iter().filter_map(|s| s.measure(config)) {
        cursor = align_up(cursor, align) + size;
        max_align = max_align.max(align);
    }
    (align_up(cursor, max_align), max_align)
}

fn place_struct(
    slots: &[Slot],
    prefix: &str,
    base: u32,
    config: &BuildConfig,
    out: &mut Vec<(String, FieldDescriptor)>,
) {
    let mut cursor = 0;
    for slot in slots {
        if let Some((size, align)) = slot.measure(config) {
            cursor = align_up(cursor, align);
            slot.place(prefix, base + cursor, config, out);
            cursor += size;
        }
    }
}

impl RecordDef {
    /// Lay the record out for a build, `None` if the record is absent
    pub fn compute(&self, config: &BuildConfig) -> Option<RecordLayout> {
        if let Some(feature) = self.requires {
            if !config.has(feature) {
                return None;
            }
        }
        let mut fields = Vec::new();
        place_struct(self.slots, "", 0, config, &mut fields);
        let (size, _) = measure_struct(self.slots, config);
        Some(RecordLayout { name: self.name, size, fields })
    }
}
