//! Schema model and value codec for soulstore.
//!
//! Defines the declarative side of the engine, with no I/O:
//! - [`Schema`]: an entity type with its attributes and persistence policy
//! - [`AttributeSpec`]: the resolved policy of one attribute, built from
//!   [`AttributeOptions`] merged over kind presets and global defaults
//! - [`SchemaRegistry`]: one cached `Arc<Schema>` per origin
//! - [`codec`]: tagged wire strings and value classification
//! - [`EntityHooks`]: optional validation and post-restore callbacks

mod attribute;
pub mod codec;
mod entity;
mod error;
mod handler;
mod schema;

pub use attribute::{AttributeKind, AttributeOptions, AttributeSpec, SimpleType};
pub use codec::ValueClass;
pub use entity::AttributeView;
pub use error::{ModelError, ModelResult};
pub use handler::EntityHooks;
pub use schema::{
    AutoComplete, DeriveFn, NamingMode, Schema, SchemaBuilder, SchemaRegistry, ARRAY_ORIGIN,
    OBJECT_ORIGIN,
};
