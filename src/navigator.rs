//! Per-navigation matching and injection.
//!
//! For every committed navigation the navigator lists the stored scripts,
//! tests each script's `@match` pattern against the destination URL and hands
//! the body of every matching script to the host [`Injector`]. Each script is
//! handled on its own: a broken pattern or a failed injection is recorded in
//! the [`NavigationReport`] and the remaining scripts still run.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::InjectionError;
use crate::pattern::{PatternCache, PatternError};
use crate::storage::KeyValueStore;
use crate::store::ScriptStore;

/// Opaque handle for the execution context a navigation landed in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(String);

impl TabId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TabId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u32> for TabId {
    fn from(id: u32) -> Self {
        Self(id.to_string())
    }
}

/// A committed top-level navigation delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationEvent {
    pub tab_id: TabId,
    pub url: String,
}

impl NavigationEvent {
    pub fn new(tab_id: impl Into<TabId>, url: impl Into<String>) -> Self {
        Self {
            tab_id: tab_id.into(),
            url: url.into(),
        }
    }
}

/// Host primitive that runs code in a tab's page context.
///
/// Implementations only issue the call; they do not wait for the injected
/// code to finish.
pub trait Injector {
    fn inject(&self, tab_id: &TabId, code: &str) -> Result<(), InjectionError>;
}

impl<T: Injector + ?Sized> Injector for &T {
    fn inject(&self, tab_id: &TabId, code: &str) -> Result<(), InjectionError> {
        (**self).inject(tab_id, code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    /// No `@match` key. Such scripts never run.
    NoMatchDeclared,
    NotMatched,
    MalformedPattern(PatternError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Injected,
    Skipped(SkipReason),
    Failed(InjectionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub script_id: String,
    pub name: String,
    pub outcome: Outcome,
}

/// What happened to each stored script for one navigation, in store order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationReport {
    pub tab_id: TabId,
    pub url: String,
    pub outcomes: Vec<ScriptOutcome>,
    /// Set when the store could not be read and nothing was evaluated.
    pub listing_error: Option<String>,
}

impl NavigationReport {
    fn new(event: &NavigationEvent) -> Self {
        Self {
            tab_id: event.tab_id.clone(),
            url: event.url.clone(),
            outcomes: Vec::new(),
            listing_error: None,
        }
    }

    pub fn injected(&self) -> impl Iterator<Item = &ScriptOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == Outcome::Injected)
    }

    pub fn injected_count(&self) -> usize {
        self.injected().count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ScriptOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Failed(_)))
    }
}

pub struct Navigator<S> {
    store: Arc<ScriptStore<S>>,
    patterns: PatternCache,
}

impl<S: KeyValueStore> Navigator<S> {
    pub fn new(store: Arc<ScriptStore<S>>) -> Self {
        Self {
            store,
            patterns: PatternCache::new(),
        }
    }

    pub fn store(&self) -> &Arc<ScriptStore<S>> {
        &self.store
    }

    /// Match and inject every stored script for one navigation.
    ///
    /// Never fails: an unreadable store injects nothing, and per-script
    /// problems are reported in the returned outcomes.
    pub fn handle<I>(&self, event: &NavigationEvent, injector: &I) -> NavigationReport
    where
        I: Injector + ?Sized,
    {
        let mut report = NavigationReport::new(event);

        let records = match self.store.list() {
            Ok(records) => records,
            Err(e) => {
                warn!("Skipping scripts for {}: failed to read store: {}", event.url, e);
                report.listing_error = Some(e.to_string());
                return report;
            }
        };

        for (index, record) in records.iter().enumerate() {
            let metadata = record.metadata();
            let name = metadata.display_name(index);

            let outcome = if !record.enabled {
                Outcome::Skipped(SkipReason::Disabled)
            } else {
                match metadata.match_pattern() {
                    None => Outcome::Skipped(SkipReason::NoMatchDeclared),
                    Some(pattern) => match self.patterns.matches(pattern, &event.url) {
                        Err(e) => {
                            warn!("Script '{}' has an unusable @match: {}", name, e);
                            Outcome::Skipped(SkipReason::MalformedPattern(e))
                        }
                        Ok(false) => Outcome::Skipped(SkipReason::NotMatched),
                        Ok(true) => {
                            match injector.inject(&event.tab_id, &record.body()) {
                                Ok(()) => {
                                    info!("Injected '{}' into tab {}", name, event.tab_id);
                                    Outcome::Injected
                                }
                                Err(e) => {
                                    warn!("Failed to inject '{}' into tab {}: {}", name, event.tab_id, e);
                                    Outcome::Failed(e)
                                }
                            }
                        }
                    },
                }
            };

            debug!("{} -> '{}': {:?}", event.url, name, outcome);
            report.outcomes.push(ScriptOutcome {
                script_id: record.id.clone(),
                name,
                outcome,
            });
        }

        report
    }
}
