//! Cross-crate integration tests: real store, real transport, both managers.
//!
//! The store's insert hook plays the backend's realtime echo, so a write by
//! one session fans out to every open subscription on that conversation's
//! topic, the way the deployed system behaves.
