//! Behaviour scenarios and shared test doubles.

pub(crate) mod support;
