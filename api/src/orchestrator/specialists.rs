//! Responder lookup by tag, plus the one specialist that needs no upstream.

use std::sync::Arc;

use async_trait::async_trait;
use switchyard_core::dispatch::{SpecialistResult, responders};

use super::ports::{ResponderDescriptor, Specialist, SpecialistContext, UpstreamError};

/// Registered specialists in registration order. Registering a tag twice
/// replaces the earlier entry in place.
#[derive(Clone, Default)]
pub struct SpecialistRegistry {
    entries: Vec<Arc<dyn Specialist>>,
}

impl SpecialistRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, specialist: Arc<dyn Specialist>) -> &mut Self {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.tag() == specialist.tag())
        {
            Some(slot) => *slot = specialist,
            None => self.entries.push(specialist),
        }
        self
    }

    pub fn with(mut self, specialist: Arc<dyn Specialist>) -> Self {
        self.register(specialist);
        self
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Specialist>> {
        self.entries
            .iter()
            .find(|specialist| specialist.tag() == tag)
            .cloned()
    }

    pub fn descriptors(&self) -> Vec<ResponderDescriptor> {
        self.entries
            .iter()
            .map(|specialist| ResponderDescriptor {
                tag: specialist.tag().to_string(),
                description: specialist.description().to_string(),
            })
            .collect()
    }
}

const GREETING: &str = "Hi! Ask me anything, or attach a document or a voice note and I'll take a look.";

/// Static welcome used when nothing more specific applies.
pub struct Greeter;

#[async_trait]
impl Specialist for Greeter {
    fn tag(&self) -> &str {
        responders::GREETER
    }

    fn description(&self) -> &str {
        "Greets the user and explains what the assistant can do. Use for greetings and small talk with no real request."
    }

    async fn handle(&self, _ctx: SpecialistContext<'_>) -> Result<SpecialistResult, UpstreamError> {
        Ok(SpecialistResult::text(GREETING))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl Specialist for Named {
        fn tag(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            self.1
        }

        async fn handle(&self, _ctx: SpecialistContext<'_>) -> Result<SpecialistResult, UpstreamError> {
            Ok(SpecialistResult::text(self.1))
        }
    }

    #[test]
    fn lookup_and_descriptors_follow_registration_order() {
        let registry = SpecialistRegistry::new()
            .with(Arc::new(Greeter))
            .with(Arc::new(Named("general", "answers questions")));

        assert!(registry.get("general").is_some());
        assert!(registry.get("weather").is_none());
        let tags: Vec<_> = registry.descriptors().into_iter().map(|d| d.tag).collect();
        assert_eq!(tags, vec!["greeter", "general"]);
    }

    #[test]
    fn re_registering_a_tag_replaces_it() {
        let mut registry = SpecialistRegistry::new();
        registry.register(Arc::new(Named("general", "first")));
        registry.register(Arc::new(Named("general", "second")));
        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].description, "second");
    }
}
