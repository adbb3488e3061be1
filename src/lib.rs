//! TamperTorn userscript registry.
//!
//! Stores user-authored scripts, reads their `// ==UserScript==` headers and,
//! for every page a host navigates to, injects the scripts whose `@match`
//! pattern accepts the URL.
//!
//! - [`metadata`] - header parsing and stripping
//! - [`pattern`] - `@match` glob compilation
//! - [`storage`] - key-value backends
//! - [`store`] - the durable script list
//! - [`navigator`] - per-navigation matching and injection
//! - [`inject`] - page-context injection snippets
//! - [`installer`] - install and update scripts from URLs
//! - `desktop` - Tauri plugin (feature `desktop`)
//!
//! ```no_run
//! use std::sync::Arc;
//! use tampertorn_lib::{EvalInjector, MemoryStorage, NavigationEvent, Navigator, ScriptStore};
//!
//! let store = Arc::new(ScriptStore::new(MemoryStorage::new()));
//! store.create("// ==UserScript==\n// @match *.torn.com/*\n// ==/UserScript==\nrun();")?;
//!
//! let navigator = Navigator::new(store);
//! let injector = EvalInjector::new(|_tab: &tampertorn_lib::TabId, _code: &str| Ok(()));
//! let report = navigator.handle(&NavigationEvent::new(1u32, "https://www.torn.com/"), &injector);
//! assert_eq!(report.injected_count(), 1);
//! # Ok::<(), tampertorn_lib::StoreError>(())
//! ```

pub mod config;
pub mod inject;
pub mod installer;
pub mod metadata;
pub mod navigator;
pub mod pattern;
pub mod storage;
pub mod store;

#[cfg(feature = "desktop")]
pub mod desktop;

mod error;

pub use config::Config;
pub use error::{ConfigError, InjectionError, InstallError, InstallResult, StoreError, StoreResult};
pub use inject::{page_injection_script, EvalInjector};
pub use installer::{HttpFetcher, Installer, ScriptFetcher};
pub use metadata::{parse_metadata, strip_metadata, ScriptMetadata};
pub use navigator::{
    Injector, NavigationEvent, NavigationReport, Navigator, Outcome, ScriptOutcome, SkipReason, TabId,
};
pub use pattern::{url_matches, MatchPattern, PatternCache, PatternError};
pub use storage::{FileStorage, KeyValueStore, MemoryStorage, StorageError};
pub use store::{ScriptRecord, ScriptStore};
