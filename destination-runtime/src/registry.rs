//! Destination registry - loaded destinations by slug.

use crate::connectors::webhook::WebhookDestination;
use crate::destination::{Destination, LoadedDestination, RegistrationError};
use std::sync::Arc;
use tracing::info;

/// Returns all built-in destinations.
pub fn get_all_destinations() -> Vec<Arc<dyn Destination>> {
    vec![Arc::new(WebhookDestination::new())]
}

#[derive(Default)]
pub struct DestinationRegistry {
    destinations: Vec<Arc<LoadedDestination>>,
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every built-in destination.
    pub fn builtin() -> Result<Self, RegistrationError> {
        let mut registry = Self::new();
        for destination in get_all_destinations() {
            registry.register(destination)?;
        }
        Ok(registry)
    }

    /// Compiles and registers a destination; slugs must be unique.
    pub fn register(&mut self, definition: Arc<dyn Destination>) -> Result<(), RegistrationError> {
        let slug = definition.slug().to_string();
        if self.get(&slug).is_some() {
            return Err(RegistrationError {
                destination: slug,
                context: "registry".to_string(),
                message: "slug already registered".to_string(),
            });
        }

        let loaded = LoadedDestination::load(definition)?;
        info!(
            destination = %slug,
            actions = loaded.actions().count(),
            audience = loaded.audience().is_some(),
            "Registered destination"
        );
        self.destinations.push(Arc::new(loaded));
        Ok(())
    }

    pub fn get(&self, slug: &str) -> Option<Arc<LoadedDestination>> {
        self.destinations.iter().find(|d| d.slug() == slug).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<LoadedDestination>> {
        self.destinations.iter()
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}
