//! Resolver interface (C8, §4.8, §6) and `LanguageDetector` (§6), both
//! external collaborators in `spec.md`'s terms but implemented here with one
//! concrete, trivial strategy so the sidecar is runnable standalone and
//! integration tests have something real to exercise.

use std::path::Path;

/// Pure strategy producing an argv from `(rootPath, language)`. The sidecar
/// treats the returned argv as opaque (§4.8).
pub trait LanguageServerResolver: Send + Sync {
    /// Resolve `language` to a command line to spawn, or `Err` if no server
    /// is available for it (the "not installed" admission error in §7.4).
    fn resolve(&self, root_path: &str, language: &str) -> Result<Vec<String>, String>;
}

/// Looks up a well-known binary name per language on `PATH` via `which`.
/// Real per-toolchain probing (local `node_modules`, version managers, etc.)
/// is explicitly out of scope (§1) — this exists to make the sidecar
/// runnable and testable without a host-supplied resolver.
pub struct PathResolver;

impl PathResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn binary_for(language: &str) -> Option<&'static str> {
        match language {
            "rust" => Some("rust-analyzer"),
            "typescript" | "javascript" => Some("typescript-language-server"),
            "python" => Some("pyright-langserver"),
            "go" => Some("gopls"),
            "cpp" | "c" => Some("clangd"),
            "csharp" => Some("omnisharp"),
            _ => None,
        }
    }
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageServerResolver for PathResolver {
    fn resolve(&self, _root_path: &str, language: &str) -> Result<Vec<String>, String> {
        let binary = Self::binary_for(language)
            .ok_or_else(|| format!("no language server configured for {language}"))?;
        let path = which::which(binary)
            .map_err(|_| format!("{binary} not found on PATH for language {language}"))?;
        let mut argv = vec![path.to_string_lossy().into_owned()];
        if language == "typescript" || language == "javascript" {
            argv.push("--stdio".to_string());
        }
        Ok(argv)
    }
}

/// Guess a language from marker files in a workspace root, used only by
/// `warmup` (§6).
pub struct LanguageDetector;

impl LanguageDetector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Detect a language from well-known marker files, or `None` if no
    /// marker is present.
    #[must_use]
    pub fn detect(&self, root_path: &Path) -> Option<&'static str> {
        const MARKERS: &[(&str, &str)] = &[
            ("package.json", "typescript"),
            ("go.mod", "go"),
            ("requirements.txt", "python"),
            ("pyproject.toml", "python"),
            ("CMakeLists.txt", "cpp"),
        ];
        for (marker, language) in MARKERS {
            if root_path.join(marker).exists() {
                return Some(language);
            }
        }
        if has_extension_match(root_path, "csproj") || has_extension_match(root_path, "sln") {
            return Some("csharp");
        }
        None
    }
}

impl Default for LanguageDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn has_extension_match(dir: &Path, ext: &str) -> bool {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .any(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some(ext))
}

/// Normalize a language identifier, collapsing the JSX/TSX aliases the host
/// sends into their base language (§4.5).
#[must_use]
pub fn normalize_language(language: &str) -> String {
    match language {
        "typescriptreact" => "typescript".to_string(),
        "javascriptreact" => "javascript".to_string(),
        other => other.to_string(),
    }
}

/// A resolver that always succeeds with a fixed argv, regardless of root or
/// language. Used by unit and integration tests to stand in for a real
/// language server (typically a small fake-server script), so the rest of
/// the pipeline can be exercised without anything real installed.
pub struct FixedResolver(pub Vec<String>);

impl LanguageServerResolver for FixedResolver {
    fn resolve(&self, _root_path: &str, _language: &str) -> Result<Vec<String>, String> {
        Ok(self.0.clone())
    }
}
