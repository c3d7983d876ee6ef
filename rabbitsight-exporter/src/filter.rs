//! Include/exclude filtering of broker entities.

use regex::Regex;

/// Entity classes that can be filtered independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityClass {
    Exchange,
    Queue,
    Vhost,
}

impl EntityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityClass::Exchange => "exchange",
            EntityClass::Queue => "queue",
            EntityClass::Vhost => "vhost",
        }
    }
}

/// An include/exclude pattern pair.
#[derive(Debug, Clone)]
pub struct EntityRule {
    include: Regex,
    exclude: Regex,
}

impl EntityRule {
    /// Patterns that report every entity except the one with an empty name.
    pub const DEFAULT_INCLUDE: &'static str = ".*";
    pub const DEFAULT_EXCLUDE: &'static str = "^$";

    pub fn new(include: &str, exclude: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            include: Regex::new(include)?,
            exclude: Regex::new(exclude)?,
        })
    }

    /// Exclusion wins over inclusion.
    pub fn matches(&self, name: &str) -> bool {
        !self.exclude.is_match(name) && self.include.is_match(name)
    }
}

impl Default for EntityRule {
    fn default() -> Self {
        Self {
            include: Regex::new(Self::DEFAULT_INCLUDE).expect("valid default include pattern"),
            exclude: Regex::new(Self::DEFAULT_EXCLUDE).expect("valid default exclude pattern"),
        }
    }
}

/// Compiled entity filters plus the per-class entity cap.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    exchange: EntityRule,
    queue: EntityRule,
    vhost: EntityRule,
    /// Maximum entities reported per class and fetch (0 = unlimited).
    max_entities: usize,
}

impl EntityFilter {
    pub fn new(
        exchange: EntityRule,
        queue: EntityRule,
        vhost: EntityRule,
        max_entities: usize,
    ) -> Self {
        Self {
            exchange,
            queue,
            vhost,
            max_entities,
        }
    }

    fn rule(&self, class: EntityClass) -> &EntityRule {
        match class {
            EntityClass::Exchange => &self.exchange,
            EntityClass::Queue => &self.queue,
            EntityClass::Vhost => &self.vhost,
        }
    }

    /// Decide whether an entity should be reported.
    pub fn should_report(&self, class: EntityClass, name: &str) -> bool {
        self.rule(class).matches(name)
    }

    pub fn max_entities(&self) -> usize {
        self.max_entities
    }

    /// Start a capped pass over one fetch of entities.
    pub fn pass(&self, class: EntityClass) -> EntityPass<'_> {
        EntityPass {
            filter: self,
            class,
            accepted: 0,
        }
    }
}

/// Tracks accepted entities for one class during one fetch.
#[derive(Debug)]
pub struct EntityPass<'a> {
    filter: &'a EntityFilter,
    class: EntityClass,
    accepted: usize,
}

impl EntityPass<'_> {
    /// True once the cap has been reached; callers stop iterating.
    pub fn is_full(&self) -> bool {
        self.filter.max_entities > 0 && self.accepted >= self.filter.max_entities
    }

    /// Evaluate a candidate and count it when accepted.
    pub fn admit(&mut self, name: &str) -> bool {
        if self.is_full() || !self.filter.should_report(self.class, name) {
            return false;
        }
        self.accepted += 1;
        true
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }
}
