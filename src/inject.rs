//! Page-context injection snippets.
//!
//! Hosts such as webviews evaluate code in an isolated world. To reach the
//! page's own globals the body is shipped base64-encoded and executed through
//! a `<script>` element appended to the document.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::error::InjectionError;
use crate::navigator::{Injector, TabId};

/// Attribute set on the temporary `<script>` element.
pub const SCRIPT_MARKER_ATTRIBUTE: &str = "data-tampertorn";

/// Build a snippet that runs `body` in the top-level page's main world.
///
/// The snippet does nothing inside iframes. Errors thrown while appending the
/// element are logged to the page console.
pub fn page_injection_script(body: &str) -> String {
    let encoded = BASE64.encode(body.as_bytes());

    format!(
        r#"(function() {{
  if (window !== window.top) return;
  function decodeBase64(str) {{
    return decodeURIComponent(atob(str).split('').map(function(c) {{
      return '%' + ('00' + c.charCodeAt(0).toString(16)).slice(-2);
    }}).join(''));
  }}
  try {{
    var script = document.createElement('script');
    script.textContent = decodeBase64('{encoded}');
    script.setAttribute('{marker}', 'userscript');
    (document.head || document.documentElement).appendChild(script);
    script.remove();
  }} catch (e) {{
    console.error('[TamperTorn] Failed to inject userscript:', e);
  }}
}})();
"#,
        encoded = encoded,
        marker = SCRIPT_MARKER_ATTRIBUTE,
    )
}

/// [`Injector`] over a host `eval(tab, code)` primitive.
///
/// Each body is wrapped with [`page_injection_script`] before evaluation.
pub struct EvalInjector<F> {
    eval: F,
}

impl<F> EvalInjector<F>
where
    F: Fn(&TabId, &str) -> Result<(), InjectionError>,
{
    pub fn new(eval: F) -> Self {
        Self { eval }
    }
}

impl<F> Injector for EvalInjector<F>
where
    F: Fn(&TabId, &str) -> Result<(), InjectionError>,
{
    fn inject(&self, tab_id: &TabId, code: &str) -> Result<(), InjectionError> {
        (self.eval)(tab_id, &page_injection_script(code))
    }
}
