//! Anti-detection profiles
//!
//! Three escalating levels of page-scoped evasion, applied by the
//! `enable_stealth` recovery action. Low patches the obvious automation
//! flags, medium adds plugin and language spoofing, high layers on
//! WebGL vendor and canvas noise. Scripts are injected via
//! `Page.addScriptToEvaluateOnNewDocument` so they run before any site
//! code on every subsequent navigation.

use anyhow::{Context, Result};
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StealthLevel {
    #[default]
    Off,
    Low,
    Med,
    High,
}

impl StealthLevel {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "med" | "medium" => Some(Self::Med),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

const WEBDRIVER_EVASION: &str = r"
    Object.defineProperty(navigator, 'webdriver', { get: () => false });
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Array;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Promise;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Symbol;
";

const LANGUAGE_EVASION: &str = r"
    Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
    Object.defineProperty(navigator, 'vendor', { get: () => 'Google Inc.' });
";

const PLUGIN_EVASION: &str = r"
    const mockPlugins = [
        { name: 'Chrome PDF Plugin', description: 'Portable Document Format', filename: 'internal-pdf-viewer' },
        { name: 'Chrome PDF Viewer', description: '', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai' },
        { name: 'Native Client', description: '', filename: 'internal-nacl-plugin' }
    ];
    Object.defineProperty(navigator, 'plugins', {
        get: () => {
            const plugins = {};
            mockPlugins.forEach((plugin, i) => {
                plugins[i] = plugin;
                plugins[plugin.name] = plugin;
            });
            Object.defineProperty(plugins, 'length', { value: mockPlugins.length });
            return plugins;
        }
    });
";

const CHROME_RUNTIME_EVASION: &str = r"
    if (!window.chrome) { window.chrome = {}; }
    if (!window.chrome.runtime) {
        window.chrome.runtime = {
            connect: () => ({
                onMessage: { addListener: () => {}, removeListener: () => {} },
                postMessage: () => {}
            })
        };
    }
";

const WEBGL_EVASION: &str = r"
    const getParameterProxyHandler = {
        apply: function(target, ctx, args) {
            const param = (args && args[0]) || null;
            if (param === 37445) { return 'Intel Inc.'; }
            if (param === 37446) { return 'Intel Iris OpenGL Engine'; }
            return Reflect.apply(target, ctx, args);
        }
    };
    if (window.WebGLRenderingContext) {
        const getParameter = WebGLRenderingContext.prototype.getParameter;
        WebGLRenderingContext.prototype.getParameter = new Proxy(getParameter, getParameterProxyHandler);
    }
";

fn canvas_evasion(seed: &str) -> String {
    format!(
        r"
    const seed = '{seed}';
    let seedIndex = 0;
    const nextNoise = () => {{
        const c = seed.charCodeAt(seedIndex % seed.length);
        seedIndex += 1;
        return (c % 3) - 1;
    }};
    const originalToDataURL = HTMLCanvasElement.prototype.toDataURL;
    HTMLCanvasElement.prototype.toDataURL = function(...args) {{
        const ctx = this.getContext('2d');
        if (ctx && this.width > 0 && this.height > 0) {{
            const image = ctx.getImageData(0, 0, this.width, this.height);
            for (let i = 0; i < image.data.length; i += 101) {{
                image.data[i] = Math.min(255, Math.max(0, image.data[i] + nextNoise()));
            }}
            ctx.putImageData(image, 0, 0);
        }}
        return originalToDataURL.apply(this, args);
    }};
"
    )
}

/// Scripts for a level, in injection order
fn scripts_for(level: StealthLevel) -> Vec<String> {
    let mut scripts = Vec::new();
    if level >= StealthLevel::Low {
        scripts.push(WEBDRIVER_EVASION.to_string());
        scripts.push(CHROME_RUNTIME_EVASION.to_string());
    }
    if level >= StealthLevel::Med {
        scripts.push(LANGUAGE_EVASION.to_string());
        scripts.push(PLUGIN_EVASION.to_string());
    }
    if level >= StealthLevel::High {
        scripts.push(WEBGL_EVASION.to_string());
        // Per-session seed keeps the canvas fingerprint stable within a
        // lease but distinct across leases
        let seed: String = (0..16)
            .map(|_| rand::random::<u8>())
            .map(|b| format!("{b:02x}"))
            .collect();
        scripts.push(canvas_evasion(&seed));
    }
    scripts
}

/// Inject the evasion scripts for a level into a page
pub async fn inject(page: &Page, level: StealthLevel) -> Result<()> {
    if level == StealthLevel::Off {
        return Ok(());
    }
    let scripts = scripts_for(level);
    debug!("Injecting {} stealth scripts at level {level:?}", scripts.len());

    for script in &scripts {
        // Persist for future navigations
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(script.clone()))
            .await
            .context("Failed to register stealth script")?;
        // And patch the already-loaded document
        page.evaluate(script.as_str())
            .await
            .context("Failed to evaluate stealth script")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_escalate() {
        assert!(StealthLevel::High > StealthLevel::Med);
        assert!(StealthLevel::Med > StealthLevel::Low);
        assert!(StealthLevel::Low > StealthLevel::Off);
    }

    #[test]
    fn parse_accepts_aliases() {
        assert_eq!(StealthLevel::parse("medium"), Some(StealthLevel::Med));
        assert_eq!(StealthLevel::parse("HIGH"), Some(StealthLevel::High));
        assert_eq!(StealthLevel::parse("none"), None);
    }

    #[test]
    fn script_count_grows_with_level() {
        assert!(scripts_for(StealthLevel::Low).len() < scripts_for(StealthLevel::Med).len());
        assert!(scripts_for(StealthLevel::Med).len() < scripts_for(StealthLevel::High).len());
    }
}
