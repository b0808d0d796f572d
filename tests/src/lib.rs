//! Workspace integration tests live under `tests/`; this crate has no library code of its own.
