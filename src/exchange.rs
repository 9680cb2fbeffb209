// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Builder for the exchanges the reliability topology declares: the topic
//! exchange carrying order events and the direct dead-letter exchange.

/// Exchange routing behaviors used by this crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Exact routing-key match
    #[default]
    Direct,
    /// Wildcard pattern match on the routing key
    Topic,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of an exchange with its declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
}

impl ExchangeDefinition {
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            delete: false,
        }
    }

    /// Name of the exchange as declared on the broker.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_kind_and_durability() {
        let def = ExchangeDefinition::new("orders").topic().durable();

        assert_eq!(def.name(), "orders");
        assert_eq!(def.kind, ExchangeKind::Topic);
        assert!(def.durable);
        assert!(!def.delete);
    }

    #[test]
    fn kind_maps_to_lapin() {
        assert_eq!(
            lapin::ExchangeKind::from(ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        );
        assert_eq!(
            lapin::ExchangeKind::from(ExchangeKind::Direct),
            lapin::ExchangeKind::Direct
        );
    }
}
