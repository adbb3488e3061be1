//! Installing and updating scripts from remote URLs.
//!
//! Scripts installed from a URL remember it in `source_url`. Refreshing
//! prefers the script's own `@updateURL`, then `@downloadURL`, then the URL it
//! was installed from.

use chrono::Utc;
use log::{info, warn};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use std::time::Duration;

use crate::config::Config;
use crate::error::{InstallError, InstallResult, StoreError};
use crate::metadata::has_metadata_block;
use crate::storage::KeyValueStore;
use crate::store::{ScriptRecord, ScriptStore};

/// Source of script text for a URL.
pub trait ScriptFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> InstallResult<String>;
}

/// Blocking HTTPS fetcher.
///
/// Do not call from inside an async runtime; run it on a blocking thread.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    timeout: Duration,
    max_bytes: usize,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Self {
        Self {
            timeout: config.fetch_timeout(),
            max_bytes: config.max_script_bytes,
            user_agent: config.user_agent.clone(),
        }
    }
}

impl ScriptFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> InstallResult<String> {
        require_https(url)?;

        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| InstallError::Network(format!("Failed to create HTTP client: {}", e)))?;

        let response = client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    InstallError::Timeout {
                        url: url.to_string(),
                        secs: self.timeout.as_secs(),
                    }
                } else if e.is_connect() {
                    InstallError::Connect(url.to_string())
                } else {
                    InstallError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown error").to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        check_content_type(content_type.as_deref())?;

        if let Some(length) = response.content_length() {
            check_size(usize::try_from(length).unwrap_or(usize::MAX), self.max_bytes)?;
        }

        let body = response
            .text()
            .map_err(|e| InstallError::Network(format!("Failed to read response: {}", e)))?;
        check_size(body.len(), self.max_bytes)?;

        Ok(body)
    }
}

pub fn require_https(url: &str) -> InstallResult<()> {
    if url.starts_with("https://") {
        Ok(())
    } else {
        Err(InstallError::InsecureUrl(url.to_string()))
    }
}

/// Accept JavaScript or plain text; a missing header is accepted.
pub fn check_content_type(content_type: Option<&str>) -> InstallResult<()> {
    match content_type {
        Some(value) if !value.contains("javascript") && !value.contains("text/plain") => {
            Err(InstallError::ContentType(value.to_string()))
        }
        _ => Ok(()),
    }
}

pub fn check_size(size: usize, max: usize) -> InstallResult<()> {
    if size > max {
        Err(InstallError::TooLarge { size, max })
    } else {
        Ok(())
    }
}

fn installed_from(record: &ScriptRecord, url: &str) -> bool {
    record.source_url.as_deref() == Some(url)
}

/// URL a record is refreshed from, if any.
pub fn update_source(record: &ScriptRecord) -> Option<String> {
    let metadata = record.metadata();
    metadata
        .update_url()
        .or_else(|| metadata.download_url())
        .map(str::to_string)
        .or_else(|| record.source_url.clone())
}

pub struct Installer<'a, S, F: ?Sized> {
    store: &'a ScriptStore<S>,
    fetcher: &'a F,
    config: &'a Config,
}

impl<'a, S, F> Installer<'a, S, F>
where
    S: KeyValueStore,
    F: ScriptFetcher + ?Sized,
{
    pub fn new(store: &'a ScriptStore<S>, fetcher: &'a F, config: &'a Config) -> Self {
        Self {
            store,
            fetcher,
            config,
        }
    }

    /// Download a script and append it to the store.
    pub fn install(&self, url: &str) -> InstallResult<ScriptRecord> {
        require_https(url)?;

        // Check for duplicate URLs before downloading anything
        if self.store.list()?.iter().any(|r| installed_from(r, url)) {
            return Err(InstallError::AlreadyInstalled(url.to_string()));
        }

        let code = self.fetch_userscript(url)?;

        let mut record = ScriptRecord::new(code);
        record.source_url = Some(url.to_string());
        record.checked_at = Some(record.created_at);

        // Another install of the same URL may have finished during the fetch
        let record = self
            .store
            .insert_unless(record, |records| records.iter().any(|r| installed_from(r, url)))?
            .ok_or_else(|| InstallError::AlreadyInstalled(url.to_string()))?;

        info!("Installed script {} from {}", record.id, url);
        Ok(record)
    }

    /// Re-download one script, keeping its id, enabled flag and position.
    pub fn refresh(&self, id: &str) -> InstallResult<ScriptRecord> {
        let record = self.store.get(id)?;
        let url = update_source(&record).ok_or_else(|| InstallError::NoSourceUrl(id.to_string()))?;

        let code = self.fetch_userscript(&url)?;

        let now = Utc::now().timestamp();
        let record = self.store.modify(id, |current| {
            current.code = code;
            current.updated_at = now;
            current.checked_at = Some(now);
            current.last_fetch_error = None;
        })?;

        info!("Refreshed script {} from {}", record.id, url);
        Ok(record)
    }

    /// Refresh every installed script that is due, returning how many changed.
    ///
    /// Only scripts installed from a URL are considered, so hand-written
    /// scripts are never overwritten. Failures are stored on the record and
    /// retried after the backoff interval. Only the fetched code and the fetch
    /// bookkeeping are written back; other edits made meanwhile are kept.
    pub fn auto_update(&self, now: i64) -> InstallResult<usize> {
        let interval = i64::try_from(self.config.update_interval_secs).unwrap_or(i64::MAX);
        let backoff = i64::try_from(self.config.error_backoff_secs).unwrap_or(i64::MAX);
        let mut updated_count = 0;

        for record in self.store.list()? {
            if record.source_url.is_none() {
                continue;
            }
            let Some(url) = update_source(&record) else {
                continue;
            };

            let last_checked = record.checked_at.unwrap_or(record.updated_at);
            let wait = if record.last_fetch_error.is_some() {
                backoff
            } else {
                interval
            };
            if now.saturating_sub(last_checked) < wait {
                continue;
            }

            let fetched = self.fetch_userscript(&url);
            let result = self.store.modify(&record.id, |current| {
                match &fetched {
                    Ok(code) => {
                        current.code = code.clone();
                        current.updated_at = now;
                        current.last_fetch_error = None;
                    }
                    Err(e) => current.last_fetch_error = Some(e.to_string()),
                }
                current.checked_at = Some(now);
            });

            match (result, fetched) {
                (Ok(_), Ok(_)) => {
                    updated_count += 1;
                    info!("Updated script {} from {}", record.id, url);
                }
                (Ok(_), Err(e)) => {
                    warn!("Failed to update script {} from {}: {}", record.id, url, e);
                }
                // The script was deleted while we were fetching
                (Err(StoreError::NotFound(_)), _) => {}
                (Err(e), _) => return Err(e.into()),
            }
        }

        Ok(updated_count)
    }

    fn fetch_userscript(&self, url: &str) -> InstallResult<String> {
        let code = self.fetcher.fetch(url)?;
        check_size(code.len(), self.config.max_script_bytes)?;
        if !has_metadata_block(&code) {
            return Err(InstallError::MissingMetadata);
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StaticFetcher {
        bodies: Mutex<HashMap<String, String>>,
        requests: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        fn serve(&self, url: &str, body: &str) {
            self.bodies
                .lock()
                .unwrap()
                .insert(url.to_string(), body.to_string());
        }

        fn unserve(&self, url: &str) {
            self.bodies.lock().unwrap().remove(url);
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl ScriptFetcher for StaticFetcher {
        fn fetch(&self, url: &str) -> InstallResult<String> {
            self.requests.lock().unwrap().push(url.to_string());
            self.bodies
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or(InstallError::Status {
                    status: 404,
                    reason: "Not Found".to_string(),
                })
        }
    }

    /// Edits the script it is fetching, like a user would mid-download.
    struct EditingFetcher<'a> {
        store: &'a ScriptStore<MemoryStorage>,
        id: String,
        body: Option<String>,
    }

    impl ScriptFetcher for EditingFetcher<'_> {
        fn fetch(&self, url: &str) -> InstallResult<String> {
            self.store.update_by_id(&self.id, "edited();").unwrap();
            self.store.set_enabled(&self.id, false).unwrap();
            self.body
                .clone()
                .ok_or_else(|| InstallError::Connect(url.to_string()))
        }
    }

    /// Finishes a competing install of the same URL during the download.
    struct RacingFetcher<'a> {
        store: &'a ScriptStore<MemoryStorage>,
    }

    impl ScriptFetcher for RacingFetcher<'_> {
        fn fetch(&self, url: &str) -> InstallResult<String> {
            let mut rival = ScriptRecord::new(userscript("1.0"));
            rival.source_url = Some(url.to_string());
            self.store.insert(rival).unwrap();
            Ok(userscript("1.0"))
        }
    }

    const URL: &str = "https://example.com/clean_travel.user.js";

    fn installed_record(store: &ScriptStore<MemoryStorage>) -> ScriptRecord {
        let mut record = ScriptRecord::new(userscript("1.0"));
        record.source_url = Some(URL.to_string());
        record.checked_at = Some(0);
        store.insert(record).unwrap()
    }

    fn userscript(version: &str) -> String {
        format!(
            "// ==UserScript==\n// @name Clean Travel\n// @version {}\n// @match *.torn.com/*\n// ==/UserScript==\nclean();\n",
            version
        )
    }

    #[test]
    fn test_validation_helpers() {
        assert!(require_https("https://a.com/x.user.js").is_ok());
        assert!(matches!(
            require_https("http://a.com/x.user.js"),
            Err(InstallError::InsecureUrl(_))
        ));

        assert!(check_content_type(None).is_ok());
        assert!(check_content_type(Some("application/javascript; charset=utf-8")).is_ok());
        assert!(check_content_type(Some("text/plain")).is_ok());
        assert!(matches!(
            check_content_type(Some("text/html")),
            Err(InstallError::ContentType(_))
        ));

        assert!(check_size(10, 10).is_ok());
        assert!(matches!(check_size(11, 10), Err(InstallError::TooLarge { .. })));
    }

    #[test]
    fn test_install_records_source() {
        let store = ScriptStore::new(MemoryStorage::new());
        let fetcher = StaticFetcher::default();
        fetcher.serve(URL, &userscript("1.0"));
        let config = Config::default();

        let record = Installer::new(&store, &fetcher, &config).install(URL).unwrap();

        assert_eq!(record.source_url.as_deref(), Some(URL));
        assert_eq!(record.code, userscript("1.0"));
        assert_eq!(store.list().unwrap(), [record]);
    }

    #[test]
    fn test_install_rejects_insecure_duplicate_and_headerless() {
        let store = ScriptStore::new(MemoryStorage::new());
        let fetcher = StaticFetcher::default();
        fetcher.serve(URL, &userscript("1.0"));
        fetcher.serve("https://example.com/plain.js", "alert(1);");
        let config = Config::default();
        let installer = Installer::new(&store, &fetcher, &config);

        assert!(matches!(
            installer.install("http://example.com/x.user.js"),
            Err(InstallError::InsecureUrl(_))
        ));
        installer.install(URL).unwrap();
        assert!(matches!(
            installer.install(URL),
            Err(InstallError::AlreadyInstalled(_))
        ));
        assert!(matches!(
            installer.install("https://example.com/plain.js"),
            Err(InstallError::MissingMetadata)
        ));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_refresh_keeps_identity() {
        let store = ScriptStore::new(MemoryStorage::new());
        let fetcher = StaticFetcher::default();
        fetcher.serve(URL, &userscript("1.0"));
        let config = Config::default();
        let installer = Installer::new(&store, &fetcher, &config);

        store.create("first();").unwrap();
        let installed = installer.install(URL).unwrap();
        store.set_enabled(&installed.id, false).unwrap();

        fetcher.serve(URL, &userscript("2.0"));
        let refreshed = installer.refresh(&installed.id).unwrap();

        assert_eq!(refreshed.id, installed.id);
        assert!(!refreshed.enabled);
        assert_eq!(refreshed.metadata().version(), Some("2.0"));
        assert_eq!(store.list().unwrap()[1].id, installed.id);
    }

    #[test]
    fn test_refresh_prefers_update_url() {
        let store = ScriptStore::new(MemoryStorage::new());
        let fetcher = StaticFetcher::default();
        let update_url = "https://cdn.example.com/meta.user.js";
        let code = format!(
            "// ==UserScript==\n// @name Hand written\n// @updateURL {}\n// ==/UserScript==\nold();",
            update_url
        );
        let record = store.create(code).unwrap();
        fetcher.serve(update_url, &userscript("3.0"));
        let config = Config::default();

        let refreshed = Installer::new(&store, &fetcher, &config)
            .refresh(&record.id)
            .unwrap();
        assert_eq!(refreshed.metadata().version(), Some("3.0"));
    }

    #[test]
    fn test_refresh_without_source_fails() {
        let store = ScriptStore::new(MemoryStorage::new());
        let fetcher = StaticFetcher::default();
        let config = Config::default();
        let record = store.create("local();").unwrap();

        assert!(matches!(
            Installer::new(&store, &fetcher, &config).refresh(&record.id),
            Err(InstallError::NoSourceUrl(_))
        ));
    }

    #[test]
    fn test_auto_update_respects_intervals() {
        let store = ScriptStore::new(MemoryStorage::new());
        let fetcher = StaticFetcher::default();
        fetcher.serve(URL, &userscript("1.0"));
        let config = Config::default();
        let installer = Installer::new(&store, &fetcher, &config);

        let installed = installer.install(URL).unwrap();
        store.create("// ==UserScript==\n// @downloadURL https://example.com/manual.user.js\n// ==/UserScript==\nmanual();").unwrap();
        let installed_at = installed.checked_at.unwrap();
        let requests_after_install = fetcher.request_count();

        // Too soon: nothing fetched
        fetcher.serve(URL, &userscript("2.0"));
        assert_eq!(installer.auto_update(installed_at + 60).unwrap(), 0);
        assert_eq!(fetcher.request_count(), requests_after_install);

        // A day later the installed script updates; the manual one is left alone
        let day_later = installed_at + 86_400;
        assert_eq!(installer.auto_update(day_later).unwrap(), 1);
        let updated = store.get(&installed.id).unwrap();
        assert_eq!(updated.metadata().version(), Some("2.0"));
        assert_eq!(fetcher.request_count(), requests_after_install + 1);

        // Failure is recorded and backed off for an hour, not a day
        fetcher.unserve(URL);
        let two_days = day_later + 86_400;
        assert_eq!(installer.auto_update(two_days).unwrap(), 0);
        let failed = store.get(&installed.id).unwrap();
        assert!(failed.last_fetch_error.is_some());
        assert_eq!(failed.metadata().version(), Some("2.0"));

        fetcher.serve(URL, &userscript("3.0"));
        assert_eq!(installer.auto_update(two_days + 60).unwrap(), 0);
        assert_eq!(installer.auto_update(two_days + 3_600).unwrap(), 1);
        let recovered = store.get(&installed.id).unwrap();
        assert!(recovered.last_fetch_error.is_none());
        assert_eq!(recovered.metadata().version(), Some("3.0"));
    }

    #[test]
    fn test_failed_auto_update_keeps_concurrent_edits() {
        let store = ScriptStore::new(MemoryStorage::new());
        let record = installed_record(&store);
        let fetcher = EditingFetcher {
            store: &store,
            id: record.id.clone(),
            body: None,
        };
        let config = Config::default();

        let now = 2 * 86_400;
        assert_eq!(Installer::new(&store, &fetcher, &config).auto_update(now).unwrap(), 0);

        let current = store.get(&record.id).unwrap();
        assert_eq!(current.code, "edited();");
        assert!(!current.enabled);
        assert!(current.last_fetch_error.is_some());
        assert_eq!(current.checked_at, Some(now));
    }

    #[test]
    fn test_successful_update_only_replaces_code() {
        let store = ScriptStore::new(MemoryStorage::new());
        let record = installed_record(&store);
        let fetcher = EditingFetcher {
            store: &store,
            id: record.id.clone(),
            body: Some(userscript("2.0")),
        };
        let config = Config::default();
        let installer = Installer::new(&store, &fetcher, &config);

        let refreshed = installer.refresh(&record.id).unwrap();
        assert_eq!(refreshed.metadata().version(), Some("2.0"));
        assert!(!refreshed.enabled);

        store.set_enabled(&record.id, true).unwrap();
        assert_eq!(installer.auto_update(refreshed.updated_at + 86_400).unwrap(), 1);
        let current = store.get(&record.id).unwrap();
        assert_eq!(current.code, userscript("2.0"));
        assert!(!current.enabled);
        assert!(current.last_fetch_error.is_none());
    }

    #[test]
    fn test_install_rechecks_duplicates_after_fetch() {
        let store = ScriptStore::new(MemoryStorage::new());
        let fetcher = RacingFetcher { store: &store };
        let config = Config::default();

        assert!(matches!(
            Installer::new(&store, &fetcher, &config).install(URL),
            Err(InstallError::AlreadyInstalled(_))
        ));
        let records = store.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_url.as_deref(), Some(URL));
    }
}
