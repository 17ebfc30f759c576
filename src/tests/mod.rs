//! Cross-module tests: the full HTTP surface against a stubbed backend.
