//! Cross-module tests over a seeded in-memory ledger

pub(crate) mod support;
