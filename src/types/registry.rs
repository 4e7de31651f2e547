//! Per-client decoder registry.
//!
//! Built-in OIDs dispatch directly; user types (domains, enums, composites,
//! extensions like citext) are learned at runtime by aliasing their OID to
//! a built-in decoder. The alias table sits behind an `RwLock`: installs
//! are rare, reads are the common path.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::types::{decode, oid, Value};

/// `pg_type.typtype` for the OIDs this crate can alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// `b`: base type; decode via `typbasetype` (domains report this too).
    Base { base_oid: u32 },
    /// `c`: composite; decode as an anonymous record.
    Composite,
    /// `e`: enum; decode the label as text.
    Enum,
    /// `d`: domain over `typbasetype`.
    Domain { base_oid: u32 },
}

impl TypeKind {
    /// Interpret a `typtype`/`typbasetype` pair from `pg_type`.
    pub fn from_pg_type(typtype: i8, typbasetype: u32) -> TypeKind {
        match typtype as u8 {
            b'c' => TypeKind::Composite,
            b'e' => TypeKind::Enum,
            b'd' => TypeKind::Domain {
                base_oid: typbasetype,
            },
            _ => TypeKind::Base {
                base_oid: typbasetype,
            },
        }
    }
}

/// Registry mapping OIDs to decoder pairs, extensible at runtime.
#[derive(Debug, Default)]
pub struct DecoderRegistry {
    aliases: RwLock<HashMap<u32, u32>>,
}

impl DecoderRegistry {
    pub fn new() -> DecoderRegistry {
        DecoderRegistry::default()
    }

    /// Follow the alias chain from `type_oid` to a decodable OID.
    fn resolve(&self, type_oid: u32) -> u32 {
        let aliases = self.aliases.read().expect("alias lock poisoned");
        let mut current = type_oid;
        // Chains are short (domain over domain); the bound only guards
        // against a cyclic install.
        for _ in 0..8 {
            match aliases.get(&current) {
                Some(next) => current = *next,
                None => break,
            }
        }
        current
    }

    /// True when a decoder (built-in or installed) exists for this OID.
    pub fn knows(&self, type_oid: u32) -> bool {
        decode::is_builtin(self.resolve(type_oid))
    }

    /// Decode a binary-format column body.
    ///
    /// Unknown OIDs fail with [`Error::UnknownDataType`] carrying the
    /// original OID so callers can install an alias and retry once.
    pub fn decode_binary(&self, type_oid: u32, buf: &[u8]) -> Result<Value> {
        let target = self.resolve(type_oid);
        match decode::decode_binary(self, target, buf) {
            Err(Error::UnknownDataType(_)) => Err(Error::UnknownDataType(type_oid)),
            other => other,
        }
    }

    /// Decode a text-format column body.
    pub fn decode_text(&self, type_oid: u32, s: &str) -> Result<Value> {
        let target = self.resolve(type_oid);
        match decode::decode_text(self, target, s) {
            Err(Error::UnknownDataType(_)) => Err(Error::UnknownDataType(type_oid)),
            other => other,
        }
    }

    /// Alias `type_oid` to decode as `target_oid`.
    pub fn install_alias(&self, type_oid: u32, target_oid: u32) {
        if type_oid == target_oid {
            return;
        }
        self.aliases
            .write()
            .expect("alias lock poisoned")
            .insert(type_oid, target_oid);
    }

    /// Install a decoder for `type_oid` from its `pg_type` row: composites
    /// decode as records, enums as text, everything else through its base
    /// type.
    pub fn install_from_kind(&self, type_oid: u32, kind: TypeKind) -> Result<()> {
        let target = match kind {
            TypeKind::Composite => oid::RECORD,
            TypeKind::Enum => oid::TEXT,
            TypeKind::Base { base_oid } | TypeKind::Domain { base_oid } => {
                if base_oid == 0 || !decode::is_builtin(self.resolve(base_oid)) {
                    return Err(Error::UnknownDataType(type_oid));
                }
                base_oid
            }
        };
        self.install_alias(type_oid, target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CITEXT: u32 = 17358;

    #[test]
    fn unknown_then_installed_then_decodes() {
        let reg = DecoderRegistry::new();
        assert!(matches!(
            reg.decode_binary(CITEXT, b"Alice").unwrap_err(),
            Error::UnknownDataType(CITEXT)
        ));

        reg.install_from_kind(CITEXT, TypeKind::Base { base_oid: oid::TEXT })
            .unwrap();
        assert!(reg.knows(CITEXT));
        assert_eq!(
            reg.decode_binary(CITEXT, b"Alice").unwrap(),
            Value::Text("Alice".into())
        );
    }

    #[test]
    fn enum_installs_as_text() {
        let reg = DecoderRegistry::new();
        reg.install_from_kind(40000, TypeKind::Enum).unwrap();
        assert_eq!(
            reg.decode_binary(40000, b"happy").unwrap(),
            Value::Text("happy".into())
        );
    }

    #[test]
    fn composite_installs_as_record() {
        let reg = DecoderRegistry::new();
        reg.install_from_kind(40001, TypeKind::Composite).unwrap();
        let body = 0i32.to_be_bytes();
        assert_eq!(
            reg.decode_binary(40001, &body).unwrap(),
            Value::Record(vec![])
        );
    }

    #[test]
    fn unresolvable_base_type_fails_install() {
        let reg = DecoderRegistry::new();
        assert!(reg
            .install_from_kind(40002, TypeKind::Base { base_oid: 0 })
            .is_err());
        assert!(reg
            .install_from_kind(40003, TypeKind::Base { base_oid: 40004 })
            .is_err());
    }

    #[test]
    fn typtype_interpretation() {
        assert_eq!(
            TypeKind::from_pg_type(b'c' as i8, 0),
            TypeKind::Composite
        );
        assert_eq!(TypeKind::from_pg_type(b'e' as i8, 0), TypeKind::Enum);
        assert_eq!(
            TypeKind::from_pg_type(b'b' as i8, 25),
            TypeKind::Base { base_oid: 25 }
        );
        assert_eq!(
            TypeKind::from_pg_type(b'd' as i8, 23),
            TypeKind::Domain { base_oid: 23 }
        );
    }
}
