// Event model and validation
pub mod event;

// Mapping directives (@path, @if, @template, @arrayPath, @json, @literal)
pub mod mapping;

// Action field schemas, coercion and payload validation
pub mod fields;

// Error taxonomy shared by the engine and destinations
pub mod errors;

// Settings and settings fingerprints
pub mod settings;

// Subscription conditions (FQL subset)
pub mod subscription;

// Encrypted token vault
pub mod credentials;

// Engine configuration
pub mod config;

pub use errors::{ActionError, ErrorKind};
pub use event::{Event, EventType};
pub use fields::{CompiledFields, FieldSchema, FieldType, Fields, Payload};
pub use mapping::{Mapping, MappingError, ResolveOptions};
pub use settings::{Settings, SettingsFingerprint};
