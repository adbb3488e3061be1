//! Tauri plugin that runs stored userscripts in desktop webviews.
//!
//! Register with `tauri::Builder::default().plugin(tampertorn_lib::desktop::init())`.
//! Every finished page load in any webview is treated as a navigation of the
//! tab named by the webview label.

use chrono::Utc;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::webview::PageLoadEvent;
use tauri::{Manager, Runtime, State};

use crate::config::Config;
use crate::error::InjectionError;
use crate::inject::EvalInjector;
use crate::installer::{HttpFetcher, Installer};
use crate::metadata::NEW_SCRIPT_TEMPLATE;
use crate::navigator::{NavigationEvent, Navigator, TabId};
use crate::storage::FileStorage;
use crate::store::{ScriptRecord, ScriptStore};

/// Script as shown in the editor's list.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptSummary {
    id: String,
    name: String,
    code: String,
    enabled: bool,
    version: Option<String>,
    description: Option<String>,
    author: Option<String>,
    match_pattern: Option<String>,
    source_url: Option<String>,
    updated_at: i64,
    last_fetch_error: Option<String>,
    /// Every declared `@key`, including ones without an accessor.
    metadata: BTreeMap<String, String>,
}

impl ScriptSummary {
    fn new(index: usize, record: &ScriptRecord) -> Self {
        let metadata = record.metadata();
        Self {
            id: record.id.clone(),
            name: metadata.display_name(index),
            code: record.code.clone(),
            enabled: record.enabled,
            version: metadata.version().map(str::to_string),
            description: metadata.description().map(str::to_string),
            author: metadata.author().map(str::to_string),
            match_pattern: metadata.match_pattern().map(str::to_string),
            source_url: record.source_url.clone(),
            updated_at: record.updated_at,
            last_fetch_error: record.last_fetch_error.clone(),
            metadata: metadata.into_map(),
        }
    }
}

/// Managed state of the plugin.
pub struct DesktopState {
    navigator: Navigator<FileStorage>,
    fetcher: Arc<HttpFetcher>,
    config: Arc<Config>,
}

impl DesktopState {
    pub fn new(config: Config) -> Self {
        let storage = FileStorage::new(&config.data_dir);
        let store = Arc::new(ScriptStore::with_key(storage, config.storage_key.clone()));
        Self {
            navigator: Navigator::new(store),
            fetcher: Arc::new(HttpFetcher::new(&config)),
            config: Arc::new(config),
        }
    }

    fn store(&self) -> &ScriptStore<FileStorage> {
        self.navigator.store()
    }

    fn summarize(&self, record: &ScriptRecord) -> ScriptSummary {
        let index = self
            .store()
            .list()
            .ok()
            .and_then(|records| records.iter().position(|r| r.id == record.id))
            .unwrap_or(0);
        ScriptSummary::new(index, record)
    }

    fn installer_parts(&self) -> (Arc<ScriptStore<FileStorage>>, Arc<HttpFetcher>, Arc<Config>) {
        (
            Arc::clone(self.navigator.store()),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.config),
        )
    }
}

#[tauri::command]
fn list_scripts(state: State<'_, DesktopState>) -> Result<Vec<ScriptSummary>, String> {
    let records = state.store().list().map_err(|e| e.to_string())?;
    Ok(records
        .iter()
        .enumerate()
        .map(|(index, record)| ScriptSummary::new(index, record))
        .collect())
}

#[tauri::command]
fn create_script(code: String, state: State<'_, DesktopState>) -> Result<ScriptSummary, String> {
    let record = state.store().create(code).map_err(|e| e.to_string())?;
    Ok(state.summarize(&record))
}

#[tauri::command]
fn update_script(id: String, code: String, state: State<'_, DesktopState>) -> Result<ScriptSummary, String> {
    let record = state.store().update_by_id(&id, code).map_err(|e| e.to_string())?;
    Ok(state.summarize(&record))
}

#[tauri::command]
fn delete_script(id: String, state: State<'_, DesktopState>) -> Result<(), String> {
    state.store().delete_by_id(&id).map_err(|e| e.to_string())?;
    Ok(())
}

#[tauri::command]
fn toggle_script(id: String, enabled: bool, state: State<'_, DesktopState>) -> Result<(), String> {
    state.store().set_enabled(&id, enabled).map_err(|e| e.to_string())?;
    Ok(())
}

#[tauri::command]
fn new_script_template() -> String {
    NEW_SCRIPT_TEMPLATE.to_string()
}

// Fetches are blocking, so they run off the async runtime
#[tauri::command]
async fn install_script(url: String, state: State<'_, DesktopState>) -> Result<ScriptSummary, String> {
    let (store, fetcher, config) = state.installer_parts();
    let record = tokio::task::spawn_blocking(move || {
        Installer::new(&*store, &*fetcher, &*config).install(&url)
    })
    .await
    .map_err(|e| format!("Task error: {}", e))?
    .map_err(|e| e.to_string())?;
    Ok(state.summarize(&record))
}

#[tauri::command]
async fn refresh_script(id: String, state: State<'_, DesktopState>) -> Result<ScriptSummary, String> {
    let (store, fetcher, config) = state.installer_parts();
    let record = tokio::task::spawn_blocking(move || {
        Installer::new(&*store, &*fetcher, &*config).refresh(&id)
    })
    .await
    .map_err(|e| format!("Task error: {}", e))?
    .map_err(|e| e.to_string())?;
    Ok(state.summarize(&record))
}

#[tauri::command]
async fn auto_update_scripts(state: State<'_, DesktopState>) -> Result<usize, String> {
    let (store, fetcher, config) = state.installer_parts();
    tokio::task::spawn_blocking(move || {
        Installer::new(&*store, &*fetcher, &*config).auto_update(Utc::now().timestamp())
    })
    .await
    .map_err(|e| format!("Task error: {}", e))?
    .map_err(|e| e.to_string())
}

/// Build the `userscripts` plugin using the config in the default data directory.
pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new("userscripts")
        .invoke_handler(tauri::generate_handler![
            list_scripts,
            create_script,
            update_script,
            delete_script,
            toggle_script,
            new_script_template,
            install_script,
            refresh_script,
            auto_update_scripts
        ])
        .setup(|app, _api| {
            let config = Config::load()?;
            app.manage(DesktopState::new(config));
            Ok(())
        })
        .on_page_load(|webview, payload| {
            if !matches!(payload.event(), PageLoadEvent::Finished) {
                return;
            }
            let Some(state) = webview.try_state::<DesktopState>() else {
                return;
            };

            let event = NavigationEvent::new(webview.label(), payload.url().as_str());
            let injector = EvalInjector::new(|tab: &TabId, code: &str| {
                if tab.as_str() != webview.label() {
                    return Err(InjectionError::TabClosed(tab.to_string()));
                }
                webview
                    .eval(code)
                    .map_err(|e| InjectionError::Rejected(e.to_string()))
            });

            let report = state.navigator.handle(&event, &injector);
            debug!(
                "Page load in '{}' ({}): {} of {} scripts injected",
                event.tab_id,
                event.url,
                report.injected_count(),
                report.outcomes.len()
            );
        })
        .build()
}
