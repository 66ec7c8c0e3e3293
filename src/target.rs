//! The target description file: symbol addresses and record layouts, as a
//! debugger would supply them, plus a few facts about the target.

use std::path::Path;

use hashbrown::HashMap;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    layout::{RecordLayout, ResolveError, SymbolResolver, TypeResolver},
    load::{self, LoadError},
    serialize::serde_addr,
    walk::WalkConfig,
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescription {
    #[serde(with = "serde_addr::map", default)]
    pub symbols: HashMap<String, u64>,
    #[serde(default)]
    pub types: HashMap<String, RecordLayout>,
    /// Entries in the size class table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_class_count: Option<usize>,
    /// Base page size of the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u64>,
    /// Largest slab order the target's allocator hands out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slab_order: Option<u64>,
}

impl TargetDescription {
    pub fn from_file<P>(path: P) -> Result<Self, LoadError>
    where
        P: AsRef<Path>,
    {
        let desc: Self = load::read_json(path.as_ref())?;
        info!(
            "target description {}: {} symbols, {} types",
            path.as_ref().display(),
            desc.symbols.len(),
            desc.types.len()
        );
        Ok(desc)
    }

    pub fn with_symbol(mut self, name: &str, address: u64) -> Self {
        self.symbols.insert(name.to_owned(), address);
        self
    }

    pub fn with_type(mut self, name: &str, layout: RecordLayout) -> Self {
        self.types.insert(name.to_owned(), layout);
        self
    }

    /// Walk settings, with anything this description leaves out defaulted
    pub fn walk_config(&self) -> WalkConfig {
        let mut config = WalkConfig::default();
        if let Some(count) = self.size_class_count {
            config.size_class_count = count;
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        if let Some(order) = self.max_slab_order {
            config.max_slab_order = order;
        }
        config
    }
}

impl SymbolResolver for TargetDescription {
    fn resolve_symbol(&self, name: &str) -> Result<u64, ResolveError> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| ResolveError::UnresolvedSymbol(name.to_owned()))
    }
}

impl TypeResolver for TargetDescription {
    fn resolve_type(&self, name: &str) -> Result<RecordLayout, ResolveError> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::UnresolvedType(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::HeapSchema,
        walk::{SIZE_CLASS_COUNT, TABLE_SYMBOL},
    };

    const DESCRIPTION: &str = r#"{
        "symbols": { "kernel::mm::heap::ALLOCATOR": "0xffff800000100000", "other": 4096 },
        "types": {
            "kernel::mm::heap::SlabHeader": {
                "size": 24,
                "fields": {
                    "link.next": { "offset": 0, "size": 8 },
                    "allocated": { "offset": 16, "size": 8 }
                }
            }
        },
        "page_size": 16384,
        "max_slab_order": 12
    }"#;

    #[test]
    fn parses_description() {
        let desc: TargetDescription = serde_json::from_str(DESCRIPTION).unwrap();
        assert_eq!(desc.resolve_symbol(TABLE_SYMBOL).unwrap(), 0xffff_8000_0010_0000);
        assert_eq!(desc.resolve_symbol("other").unwrap(), 4096);
        assert_eq!(
            desc.resolve_symbol("missing"),
            Err(ResolveError::UnresolvedSymbol("missing".to_owned()))
        );

        let header = desc.resolve_type("kernel::mm::heap::SlabHeader").unwrap();
        assert_eq!(header.size, 24);
        assert_eq!(header.field("allocated").unwrap().offset, 16);
        assert!(desc.resolve_type("kernel::mm::heap::SizeClass").is_err());
    }

    #[test]
    fn config_defaults_fill_gaps() {
        let desc: TargetDescription = serde_json::from_str(DESCRIPTION).unwrap();
        let config = desc.walk_config();
        assert_eq!(config.size_class_count, SIZE_CLASS_COUNT);
        assert_eq!(config.page_size, 16384);
        assert_eq!(config.max_slab_order, 12);
        assert_eq!(config.table_symbol, TABLE_SYMBOL);
    }

    #[test]
    fn bundled_description_resolves_a_schema() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/kernel-x86_64.json");
        let desc = TargetDescription::from_file(path).unwrap();
        let config = desc.walk_config();
        let schema = HeapSchema::resolve(&desc, &config.types).unwrap();
        assert_eq!(schema.size_class.stride, 48);
        assert_eq!(schema.slab_header.header_size, 24);
        assert_eq!(desc.resolve_symbol(TABLE_SYMBOL).unwrap(), 0xffff_ffff_8041_2000);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            TargetDescription::from_file("/nonexistent/target.json"),
            Err(LoadError::Io { .. })
        ));
    }

    #[test]
    fn serializes_addresses_as_hex() {
        let desc = TargetDescription::default().with_symbol("x", 0x1000);
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains(r#""x":"0x1000""#));
        let back: TargetDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }
}
