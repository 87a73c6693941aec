//! Lookup table from command code to [`CommandSpec`].
use std::{
    collections::BTreeMap,
    sync::{Arc, LazyLock},
};

use crate::{
    commands,
    error::RegistryError,
    field::{FieldKind, FieldSpec},
    message::{Command, CommandSpec},
};

static BUILTIN: LazyLock<Arc<Registry>> = LazyLock::new(|| {
    let specs = commands::ALL.iter().flat_map(|c| c.iter().copied());
    match Registry::from_specs(specs) {
        Ok(registry) => Arc::new(registry),
        Err(e) => panic!("invalid built-in command catalogue: {}", e),
    }
});

/// The set of commands a peer understands.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    by_code: BTreeMap<u16, CommandSpec>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// The registry of the built-in catalogue.
    ///
    /// Built on first use. A conflict in the catalogue panics right there, since
    /// it can only be a programming error.
    pub fn builtin() -> Arc<Registry> {
        Arc::clone(&BUILTIN)
    }

    pub fn from_specs(
        specs: impl IntoIterator<Item = CommandSpec>,
    ) -> Result<Registry, RegistryError> {
        let mut registry = Registry::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    /// Adds `spec`. Fails if its code is taken or one of its schemas is malformed.
    pub fn register(&mut self, spec: CommandSpec) -> Result<(), RegistryError> {
        if let Some(existing) = self.by_code.get(&spec.code) {
            return Err(RegistryError::DuplicateCode {
                code: spec.code,
                first: existing.name,
                second: spec.name,
            });
        }
        for fields in [spec.reply_fields, spec.request_fields].into_iter().flatten() {
            check_schema(spec.name, fields)?;
        }
        self.by_code.insert(spec.code, spec);
        Ok(())
    }

    /// Shorthand to register a catalogue command by type.
    pub fn register_command<C: Command>(&mut self) -> Result<(), RegistryError> {
        self.register(C::SPEC)
    }

    pub fn get(&self, code: u16) -> Option<&CommandSpec> {
        self.by_code.get(&code)
    }

    /// Whether `code` is known and may arrive unsolicited.
    pub fn supports_push(&self, code: u16) -> bool {
        self.get(code).is_some_and(|spec| spec.supports_push)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.by_code.values()
    }
}

fn check_schema(command: &'static str, fields: &[FieldSpec]) -> Result<(), RegistryError> {
    let last = fields.len().saturating_sub(1);
    for (i, field) in fields.iter().enumerate() {
        if field.kind.is_greedy() && i != last {
            return Err(RegistryError::GreedyFieldNotLast {
                command,
                field: field.name,
            });
        }
        if let FieldKind::Seq(items) = field.kind {
            if items.iter().any(|item| item.kind.is_greedy()) {
                return Err(RegistryError::GreedySequenceItem {
                    command,
                    field: field.name,
                });
            }
            // A row that consumes nothing would repeat forever.
            if items.iter().map(|item| min_width(&item.kind)).sum::<usize>() == 0 {
                return Err(RegistryError::EmptySequence {
                    command,
                    field: field.name,
                });
            }
        }
    }
    Ok(())
}

/// Fewest bytes a field of `kind` occupies on the wire.
fn min_width(kind: &FieldKind) -> usize {
    match kind {
        FieldKind::U8 | FieldKind::I8 => 1,
        FieldKind::U16 | FieldKind::I16 | FieldKind::Str => 2,
        FieldKind::U32 | FieldKind::I32 | FieldKind::Ipv4 => 4,
        FieldKind::U64 | FieldKind::I64 => 8,
        FieldKind::Ipv6 => 16,
        FieldKind::Hex(n) => *n,
        FieldKind::HexRest | FieldKind::Seq(_) | FieldKind::Json { .. } => 0,
    }
}
