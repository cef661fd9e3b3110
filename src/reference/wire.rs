// src/reference/wire.rs

//! Tagged-tuple encoding of references.
//!
//! Every reference serializes as a sequence whose first element is a type
//! tag, followed by the type-specific fields:
//!
//! | tag | fields |
//! |---|---|
//! | `f2` | id |
//! | `s2` | id, hints |
//! | `ss2` | id, location, port |
//! | `c2` | id, size, hints |
//! | `sh2` | id, preferred, size, hints |
//! | `fx` | id, location |
//! | `t2` | id, dead locations |
//! | `completed2` | id |
//! | `err` | id, reason, detail |
//! | `val` | id, bytes |

use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::model::{RefId, Reference};

impl Reference {
    /// Wire tag for this reference kind.
    pub fn wire_tag(&self) -> &'static str {
        match self {
            Reference::Future { .. } => "f2",
            Reference::Stream { .. } => "s2",
            Reference::SocketStream { .. } => "ss2",
            Reference::Concrete { .. } => "c2",
            Reference::Sweetheart { .. } => "sh2",
            Reference::Fixed { .. } => "fx",
            Reference::Tombstone { .. } => "t2",
            Reference::Completed { .. } => "completed2",
            Reference::Error { .. } => "err",
            Reference::DataValue { .. } => "val",
        }
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        seq.serialize_element(self.wire_tag())?;
        seq.serialize_element(self.id())?;
        match self {
            Reference::Future { .. } | Reference::Completed { .. } => {}
            Reference::Stream { hints, .. } => seq.serialize_element(hints)?,
            Reference::SocketStream { location, port, .. } => {
                seq.serialize_element(location)?;
                seq.serialize_element(port)?;
            }
            Reference::Concrete {
                size_hint, hints, ..
            } => {
                seq.serialize_element(size_hint)?;
                seq.serialize_element(hints)?;
            }
            Reference::Sweetheart {
                preferred,
                size_hint,
                hints,
                ..
            } => {
                seq.serialize_element(preferred)?;
                seq.serialize_element(size_hint)?;
                seq.serialize_element(hints)?;
            }
            Reference::Fixed { location, .. } => seq.serialize_element(location)?,
            Reference::Tombstone { dead, .. } => seq.serialize_element(dead)?,
            Reference::Error { reason, detail, .. } => {
                seq.serialize_element(reason)?;
                seq.serialize_element(detail)?;
            }
            Reference::DataValue { value, .. } => seq.serialize_element(value)?,
        }
        seq.end()
    }
}

struct ReferenceVisitor;

fn field<'de, A, T>(seq: &mut A, index: usize) -> Result<T, A::Error>
where
    A: SeqAccess<'de>,
    T: Deserialize<'de>,
{
    seq.next_element()?
        .ok_or_else(|| de::Error::invalid_length(index, &"a complete reference tuple"))
}

impl<'de> Visitor<'de> for ReferenceVisitor {
    type Value = Reference;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a tagged reference tuple such as [\"c2\", id, size, hints]")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Reference, A::Error> {
        let tag: String = field(&mut seq, 0)?;
        let id: RefId = field(&mut seq, 1)?;

        let reference = match tag.as_str() {
            "f2" => Reference::Future { id },
            "completed2" => Reference::Completed { id },
            "s2" => Reference::Stream {
                id,
                hints: field(&mut seq, 2)?,
            },
            "ss2" => Reference::SocketStream {
                id,
                location: field(&mut seq, 2)?,
                port: field(&mut seq, 3)?,
            },
            "c2" => Reference::Concrete {
                id,
                size_hint: field(&mut seq, 2)?,
                hints: field(&mut seq, 3)?,
            },
            "sh2" => Reference::Sweetheart {
                id,
                preferred: field(&mut seq, 2)?,
                size_hint: field(&mut seq, 3)?,
                hints: field(&mut seq, 4)?,
            },
            "fx" => Reference::Fixed {
                id,
                location: field(&mut seq, 2)?,
            },
            "t2" => Reference::Tombstone {
                id,
                dead: field(&mut seq, 2)?,
            },
            "err" => Reference::Error {
                id,
                reason: field(&mut seq, 2)?,
                detail: field(&mut seq, 3)?,
            },
            "val" => Reference::DataValue {
                id,
                value: field(&mut seq, 2)?,
            },
            other => {
                return Err(de::Error::unknown_variant(
                    other,
                    &[
                        "f2",
                        "s2",
                        "ss2",
                        "c2",
                        "sh2",
                        "fx",
                        "t2",
                        "completed2",
                        "err",
                        "val",
                    ],
                ));
            }
        };

        if seq.next_element::<de::IgnoredAny>()?.is_some() {
            return Err(de::Error::custom(format!(
                "trailing fields in '{tag}' reference tuple"
            )));
        }

        Ok(reference)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(ReferenceVisitor)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::reference::model::WorkerId;

    #[test]
    fn concrete_encodes_as_tagged_tuple() {
        let r = Reference::concrete("out:0", Some(12), ["w1", "w2"]);
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"["c2","out:0",12,["w1","w2"]]"#);
    }

    #[test]
    fn error_decodes_with_null_detail() {
        let r: Reference =
            serde_json::from_str(r#"["err","x","WORKER_FAILED",null]"#).unwrap();
        assert_eq!(r, Reference::error(RefId::new("x"), "WORKER_FAILED", None));
    }

    #[test]
    fn sweetheart_survives_the_wire() {
        let r = Reference::Sweetheart {
            id: RefId::new("x"),
            preferred: WorkerId::new("w1"),
            size_hint: None,
            hints: BTreeSet::from([WorkerId::new("w2")]),
        };
        let back: Reference = serde_json::from_str(&serde_json::to_string(&r).unwrap()).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = serde_json::from_str::<Reference>(r#"["zz","x"]"#).unwrap_err();
        assert!(err.to_string().contains("zz"));
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(serde_json::from_str::<Reference>(r#"["c2","x",1]"#).is_err());
        assert!(serde_json::from_str::<Reference>(r#"["f2","x","extra"]"#).is_err());
    }
}
