//! Column type tags stored in dataset descriptors.
//!
//! The descriptor JSON encodes column types with a small sum-type scheme that
//! must stay a stable wire contract: simple types are bare strings drawn from
//! a closed vocabulary, and three compound forms are arrays:
//!
//! - `["Union", t1, t2, ...]`
//! - `["Array", elem, dims]`
//! - `["ParametricArray", elem_bound, dims]`
//!
//! [`TypeTag`] models that contract as a tagged sum with explicit
//! constructors, plus the two relations the pipelines need: a subtype check
//! (used when validating an input table against a declared schema) and
//! sanitization (used when inferring a declared schema from an input table,
//! widening concrete types to their abstract bounds so later inserts are not
//! over-constrained).

use std::fmt;

use arrow::datatypes::DataType;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The closed set of simple (leaf) type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimpleTag {
    /// Any string type; the sanitized form of `String`.
    AbstractString,
    /// Any float type; the sanitized form of `Float64`/`Float32`.
    AbstractFloat,
    /// Any integer type; the sanitized form of the concrete integers.
    Integer,
    /// Boolean. Deliberately not sanitized to `Integer`.
    Bool,
    /// A single character.
    Char,
    /// Concrete UTF-8 string.
    String,
    /// 64-bit float.
    Float64,
    /// 32-bit float.
    Float32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit unsigned integer.
    UInt64,
    /// Timezone-aware timestamp.
    ZonedDateTime,
    /// Naive timestamp.
    DateTime,
    /// Calendar date.
    Date,
    /// The missing-value type.
    Missing,
}

impl SimpleTag {
    /// Every simple tag, in wire-name order. Used by decode tests.
    pub const ALL: [SimpleTag; 15] = [
        SimpleTag::AbstractString,
        SimpleTag::AbstractFloat,
        SimpleTag::Integer,
        SimpleTag::Bool,
        SimpleTag::Char,
        SimpleTag::String,
        SimpleTag::Float64,
        SimpleTag::Float32,
        SimpleTag::Int64,
        SimpleTag::Int32,
        SimpleTag::UInt64,
        SimpleTag::ZonedDateTime,
        SimpleTag::DateTime,
        SimpleTag::Date,
        SimpleTag::Missing,
    ];

    /// The tag's wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            SimpleTag::AbstractString => "AbstractString",
            SimpleTag::AbstractFloat => "AbstractFloat",
            SimpleTag::Integer => "Integer",
            SimpleTag::Bool => "Bool",
            SimpleTag::Char => "Char",
            SimpleTag::String => "String",
            SimpleTag::Float64 => "Float64",
            SimpleTag::Float32 => "Float32",
            SimpleTag::Int64 => "Int64",
            SimpleTag::Int32 => "Int32",
            SimpleTag::UInt64 => "UInt64",
            SimpleTag::ZonedDateTime => "ZonedDateTime",
            SimpleTag::DateTime => "DateTime",
            SimpleTag::Date => "Date",
            SimpleTag::Missing => "Missing",
        }
    }

    /// Parse a wire name. Unknown names are a decode failure for the caller.
    pub fn parse(name: &str) -> Option<Self> {
        SimpleTag::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for SimpleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A column type as stored in the descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeTag {
    /// A leaf tag from the closed vocabulary.
    Simple(SimpleTag),
    /// A union of alternatives, e.g. `["Union", "Int64", "Missing"]`.
    Union(Vec<TypeTag>),
    /// A concrete array with an exact element type.
    Array {
        /// Exact element type.
        elem: Box<TypeTag>,
        /// Number of dimensions.
        dims: u32,
    },
    /// An array whose element type is bounded above, e.g. "any integer
    /// vector". The sanitized form of [`TypeTag::Array`].
    ParametricArray {
        /// Upper bound on the element type.
        bound: Box<TypeTag>,
        /// Number of dimensions.
        dims: u32,
    },
}

impl TypeTag {
    /// Shorthand for a leaf tag.
    pub const fn simple(tag: SimpleTag) -> Self {
        TypeTag::Simple(tag)
    }

    /// True when a column of type `self` can be stored where `declared` is
    /// expected.
    ///
    /// This is a nominal relation over the closed vocabulary: a concrete tag
    /// is a subtype of its abstract bound (`String <: AbstractString`,
    /// concrete integers and `Bool` under `Integer`, concrete floats under
    /// `AbstractFloat`), unions distribute on both sides, concrete arrays
    /// match concrete arrays exactly and parametric arrays by element bound.
    pub fn is_subtype_of(&self, declared: &TypeTag) -> bool {
        use TypeTag::*;

        if self == declared {
            return true;
        }

        match (self, declared) {
            // A union fits only if every arm fits.
            (Union(arms), _) => arms.iter().all(|arm| arm.is_subtype_of(declared)),
            // A non-union fits a union if it fits any arm.
            (_, Union(arms)) => arms.iter().any(|arm| self.is_subtype_of(arm)),

            (Simple(sub), Simple(sup)) => simple_subtype(*sub, *sup),

            (Array { elem: a, dims: da }, Array { elem: b, dims: db }) => da == db && a == b,
            (
                Array { elem, dims },
                ParametricArray {
                    bound,
                    dims: bound_dims,
                },
            ) => dims == bound_dims && elem.is_subtype_of(bound),
            (
                ParametricArray { bound: a, dims: da },
                ParametricArray { bound: b, dims: db },
            ) => da == db && a.is_subtype_of(b),

            _ => false,
        }
    }

    /// Widen a concrete tag to the declared form used when creating a
    /// descriptor from observed data: concrete strings become
    /// `AbstractString`, concrete integers (except `Bool`) become `Integer`,
    /// concrete floats become `AbstractFloat`, temporal types pass through,
    /// and arrays become parametric arrays over the sanitized element.
    pub fn sanitize(&self) -> TypeTag {
        use SimpleTag::*;
        use TypeTag::*;

        match self {
            Simple(String) | Simple(Char) => TypeTag::simple(AbstractString),
            Simple(Int64) | Simple(Int32) | Simple(UInt64) => TypeTag::simple(Integer),
            Simple(Float64) | Simple(Float32) => TypeTag::simple(AbstractFloat),
            Simple(other) => TypeTag::simple(*other),
            Union(arms) => Union(arms.iter().map(TypeTag::sanitize).collect()),
            Array { elem, dims } | ParametricArray { bound: elem, dims } => ParametricArray {
                bound: Box::new(elem.sanitize()),
                dims: *dims,
            },
        }
    }

    /// The tag observed for an Arrow field, or `None` when the Arrow type has
    /// no counterpart in the vocabulary.
    pub fn from_arrow(data_type: &DataType) -> Option<TypeTag> {
        use SimpleTag::*;

        let tag = match data_type {
            DataType::Utf8 | DataType::LargeUtf8 => TypeTag::simple(String),
            DataType::Boolean => TypeTag::simple(Bool),
            DataType::Int64 => TypeTag::simple(Int64),
            DataType::Int32 => TypeTag::simple(Int32),
            DataType::UInt64 => TypeTag::simple(UInt64),
            DataType::Float64 => TypeTag::simple(Float64),
            DataType::Float32 => TypeTag::simple(Float32),
            DataType::Timestamp(_, Some(_)) => TypeTag::simple(ZonedDateTime),
            DataType::Timestamp(_, None) => TypeTag::simple(DateTime),
            DataType::Date32 | DataType::Date64 => TypeTag::simple(Date),
            DataType::Null => TypeTag::simple(Missing),
            DataType::List(field) | DataType::LargeList(field) => TypeTag::Array {
                elem: Box::new(TypeTag::from_arrow(field.data_type())?),
                dims: 1,
            },
            _ => return None,
        };
        Some(tag)
    }

    /// True when the tag names a timezone-aware timestamp, possibly under a
    /// union with `Missing`.
    pub fn is_zoned_timestamp(&self) -> bool {
        match self {
            TypeTag::Simple(SimpleTag::ZonedDateTime) => true,
            TypeTag::Union(arms) => arms.iter().any(|arm| arm.is_zoned_timestamp()),
            _ => false,
        }
    }
}

fn simple_subtype(sub: SimpleTag, sup: SimpleTag) -> bool {
    use SimpleTag::*;
    match sup {
        AbstractString => matches!(sub, AbstractString | String),
        AbstractFloat => matches!(sub, AbstractFloat | Float64 | Float32),
        Integer => matches!(sub, Integer | Int64 | Int32 | UInt64 | Bool),
        _ => sub == sup,
    }
}

/// The Arrow storage type used on the wire for a declared tag, before any
/// post-processing. Zoned and naive timestamps are stored as unix seconds.
pub fn storage_arrow_type(tag: &TypeTag) -> Option<DataType> {
    use SimpleTag::*;
    match tag {
        TypeTag::Simple(ZonedDateTime) | TypeTag::Simple(DateTime) => Some(DataType::Int64),
        TypeTag::Simple(Date) => Some(DataType::Date32),
        TypeTag::Simple(String) | TypeTag::Simple(AbstractString) | TypeTag::Simple(Char) => {
            Some(DataType::Utf8)
        }
        TypeTag::Simple(Bool) => Some(DataType::Boolean),
        TypeTag::Simple(Int64) | TypeTag::Simple(Integer) => Some(DataType::Int64),
        TypeTag::Simple(Int32) => Some(DataType::Int32),
        TypeTag::Simple(UInt64) => Some(DataType::UInt64),
        TypeTag::Simple(Float64) | TypeTag::Simple(AbstractFloat) => Some(DataType::Float64),
        TypeTag::Simple(Float32) => Some(DataType::Float32),
        _ => None,
    }
}

impl Serialize for TypeTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;

        match self {
            TypeTag::Simple(tag) => serializer.serialize_str(tag.as_str()),
            TypeTag::Union(arms) => {
                let mut seq = serializer.serialize_seq(Some(arms.len() + 1))?;
                seq.serialize_element("Union")?;
                for arm in arms {
                    seq.serialize_element(arm)?;
                }
                seq.end()
            }
            TypeTag::Array { elem, dims } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("Array")?;
                seq.serialize_element(elem)?;
                seq.serialize_element(dims)?;
                seq.end()
            }
            TypeTag::ParametricArray { bound, dims } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("ParametricArray")?;
                seq.serialize_element(bound)?;
                seq.serialize_element(dims)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for TypeTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TagVisitor;

        impl<'de> Visitor<'de> for TagVisitor {
            type Value = TypeTag;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a simple type tag string or a compound tag array")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<TypeTag, E> {
                SimpleTag::parse(value)
                    .map(TypeTag::Simple)
                    .ok_or_else(|| E::custom(format!("unknown type tag {value:?}")))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<TypeTag, A::Error> {
                let head: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("empty type tag array"))?;

                match head.as_str() {
                    "Union" => {
                        let mut arms = Vec::new();
                        while let Some(arm) = seq.next_element::<TypeTag>()? {
                            arms.push(arm);
                        }
                        if arms.is_empty() {
                            return Err(de::Error::custom("Union tag with no alternatives"));
                        }
                        Ok(TypeTag::Union(arms))
                    }
                    "Array" => {
                        let elem: TypeTag = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::custom("Array tag missing element type"))?;
                        let dims: u32 = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::custom("Array tag missing dims"))?;
                        Ok(TypeTag::Array {
                            elem: Box::new(elem),
                            dims,
                        })
                    }
                    "ParametricArray" => {
                        let bound: TypeTag = seq.next_element()?.ok_or_else(|| {
                            de::Error::custom("ParametricArray tag missing element bound")
                        })?;
                        let dims: u32 = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::custom("ParametricArray tag missing dims"))?;
                        Ok(TypeTag::ParametricArray {
                            bound: Box::new(bound),
                            dims,
                        })
                    }
                    other => Err(de::Error::custom(format!("unknown type tag {other:?}"))),
                }
            }
        }

        deserializer.deserialize_any(TagVisitor)
    }
}
