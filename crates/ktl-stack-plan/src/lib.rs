//! Stack universe loading, plan compilation and node selection.
//!
//! A stack is a directory tree of `ktl-stack.yaml` files. Every directory
//! level may contribute defaults (cluster, namespace, values, set, tags,
//! options), profile overrides and hooks; releases are declared inline or in
//! `release.yaml` files. The compiler walks each release's inheritance chain
//! from the root down, validates the merged result, assigns execution waves
//! and produces a [`Plan`]. The selector then narrows a plan to the nodes a
//! run should touch, with dependency-aware expansion.

mod compiler;
mod selector;
mod universe;

pub use compiler::{CompileError, CompileOptions, Compiler};
pub use selector::{SelectError, Selector, SelectorSpec};
pub use universe::{
    DiscoveredRelease, LevelDefaults, ReleaseSpecFile, StackFile, Universe, discover_universe,
};
