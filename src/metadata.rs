//! Userscript metadata parsing.
//!
//! A script may open with a header like:
//!
//! ```text
//! // ==UserScript==
//! // @name         Clean Travel
//! // @match        https://www.torn.com/travelagency.php*
//! // ==/UserScript==
//! ```
//!
//! The header is kept in storage and only removed when the body is injected.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ops::Range;

/// Opening marker line of a metadata block.
pub const OPEN_MARKER: &str = "// ==UserScript==";

/// Closing marker line of a metadata block.
pub const CLOSE_MARKER: &str = "// ==/UserScript==";

/// Script offered by the editor when the user creates a new script.
pub const NEW_SCRIPT_TEMPLATE: &str = "// ==UserScript==
// @name         New TamperTorn Script
// @namespace    http://tampertorn.com
// @version      1.0
// @description  A new userscript
// @author       You
// @match        https://*/*
// @grant        none
// ==/UserScript==

(function() {
    'use strict';
    console.log('TamperTorn script running!');
})();
";

// Both markers must sit on their own line; the block ends after the closing line's terminator.
static BLOCK_REGEX: Lazy<Regex> = Lazy::new(|| {
    let pattern = format!(
        r"(?ms)^[ \t]*{}[ \t]*\r?\n(.*?)^[ \t]*{}[ \t]*(?:\r?\n|\r?\z)",
        regex::escape(OPEN_MARKER),
        regex::escape(CLOSE_MARKER)
    );
    Regex::new(&pattern).expect("metadata block pattern is valid")
});

static ENTRY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[ \t]*//[ \t]*@(\w+)\s+(.+)$").expect("metadata entry pattern is valid"));

/// Key/value pairs declared in a script's metadata block.
///
/// Recognized keys get typed accessors; anything else stays reachable through
/// [`ScriptMetadata::get`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptMetadata {
    entries: BTreeMap<String, String>,
}

impl ScriptMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.get("name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.get("namespace")
    }

    pub fn version(&self) -> Option<&str> {
        self.get("version")
    }

    pub fn description(&self) -> Option<&str> {
        self.get("description")
    }

    pub fn author(&self) -> Option<&str> {
        self.get("author")
    }

    /// The `@match` pattern. Only one is honoured; the last declaration wins.
    pub fn match_pattern(&self) -> Option<&str> {
        self.get("match")
    }

    /// The `@grant` value. Parsed for display only, never enforced.
    pub fn grant(&self) -> Option<&str> {
        self.get("grant")
    }

    pub fn download_url(&self) -> Option<&str> {
        self.get("downloadURL")
    }

    pub fn update_url(&self) -> Option<&str> {
        self.get("updateURL")
    }

    /// Name shown in script lists, falling back to the 1-based list position.
    pub fn display_name(&self, index: usize) -> String {
        match self.name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("Script {}", index + 1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.entries
    }
}

fn block_range(code: &str) -> Option<(Range<usize>, Range<usize>)> {
    let captures = BLOCK_REGEX.captures(code)?;
    let whole = captures.get(0)?;
    let inner = captures.get(1)?;
    Some((whole.range(), inner.range()))
}

/// Returns true if `code` carries a metadata block.
pub fn has_metadata_block(code: &str) -> bool {
    BLOCK_REGEX.is_match(code)
}

/// Extract the metadata mapping from a script.
///
/// Lines inside the block that are not `// @key value` entries are ignored.
/// A script without a block yields an empty mapping.
pub fn parse_metadata(code: &str) -> ScriptMetadata {
    let mut metadata = ScriptMetadata::default();

    let Some((_, inner)) = block_range(code) else {
        return metadata;
    };

    for line in code[inner].lines() {
        if let Some(caps) = ENTRY_REGEX.captures(line) {
            // Later declarations overwrite earlier ones
            metadata
                .entries
                .insert(caps[1].to_string(), caps[2].trim().to_string());
        }
    }

    metadata
}

/// Remove the metadata block, leaving the executable body.
///
/// Anything before the opening marker line is kept.
pub fn strip_metadata(code: &str) -> Cow<'_, str> {
    match block_range(code) {
        None => Cow::Borrowed(code),
        Some((whole, _)) if whole.start == 0 => Cow::Borrowed(&code[whole.end..]),
        Some((whole, _)) => {
            let mut body = String::with_capacity(code.len() - whole.len());
            body.push_str(&code[..whole.start]);
            body.push_str(&code[whole.end..]);
            Cow::Owned(body)
        }
    }
}
