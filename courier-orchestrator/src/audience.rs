use std::collections::HashMap;

use courier_core::types::Audience;

/// Strategy for turning one audience descriptor into a recipient set. The
/// registry below owns one resolver per audience type; new addressing modes
/// (topics, segments) plug in here without touching the dispatch path.
pub trait AudienceResolver: Send + Sync {
    fn resolve(&self, audience: &Audience) -> Vec<String>;
}

/// The only addressing mode in production use: a single internal user.
pub struct UserResolver;

impl AudienceResolver for UserResolver {
    fn resolve(&self, audience: &Audience) -> Vec<String> {
        match audience.uid.as_deref() {
            Some(uid) if !uid.is_empty() => vec![uid.to_string()],
            _ => vec![],
        }
    }
}

pub struct AudienceResolvers {
    resolvers: HashMap<String, Box<dyn AudienceResolver>>,
}

impl AudienceResolvers {
    pub fn with_defaults() -> Self {
        let mut registry = AudienceResolvers {
            resolvers: HashMap::new(),
        };
        registry.register("user", Box::new(UserResolver));
        registry
    }

    pub fn register(&mut self, kind: &str, resolver: Box<dyn AudienceResolver>) {
        self.resolvers.insert(kind.to_string(), resolver);
    }

    /// Unregistered audience types resolve to nobody. The job still runs to
    /// completion; only the recipient set is empty.
    pub fn resolve(&self, audience: &Audience) -> Vec<String> {
        match self.resolvers.get(&audience.kind) {
            Some(resolver) => resolver.resolve(audience),
            None => {
                tracing::warn!("No audience resolver registered for type: {}", audience.kind);
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_audience_resolves_to_one_uid() {
        let registry = AudienceResolvers::with_defaults();
        assert_eq!(registry.resolve(&Audience::user("u1")), vec!["u1"]);
    }

    #[test]
    fn unknown_or_incomplete_audiences_resolve_to_nobody() {
        let registry = AudienceResolvers::with_defaults();

        let audience = Audience {
            kind: "segment".to_string(),
            uid: None,
            topic: Some("power-renters".to_string()),
        };
        assert!(registry.resolve(&audience).is_empty());

        let audience = Audience {
            kind: "user".to_string(),
            uid: None,
            topic: None,
        };
        assert!(registry.resolve(&audience).is_empty());
    }
}
