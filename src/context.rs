use crate::cache::{ResultCache, fingerprint};
use crate::config::Config;
use crate::error::Result;
use crate::model::{
    ApplyEditResult, ContextPayload, ContextScope, DependencyRecord, Edit, FindSymbolResult,
    ReferenceRecord, SourceLocation, SymbolKind, SymbolLocation, SymbolRecord,
};
use crate::registry::{SessionRegistry, SymbolProvider};
use crate::scan;
use crate::tokens::{HeuristicTokenCounter, TokenCounter};
use anyhow::Context;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, warn};

/// References kept per symbol.
const MAX_REFERENCES_PER_SYMBOL: usize = 5;

/// Raw-inclusion token cost heuristics for the narrow scopes; `file` scope
/// counts the actual text instead.
const RAW_TOKENS_FUNCTION: usize = 800;
const RAW_TOKENS_CLASS: usize = 2_000;

/// Parsed form of a context query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTarget {
    pub file: Option<PathBuf>,
    pub symbol: String,
}

/// Drives the aggregation pipeline: parse query, resolve the target file,
/// extract symbols/dependencies/references through the provider, estimate
/// token savings, and trim the payload to its budget. Results are cached by
/// fingerprint.
pub struct ContextEngine {
    workspace_root: PathBuf,
    provider: Arc<dyn SymbolProvider>,
    registry: Option<Arc<SessionRegistry>>,
    cache: Mutex<ResultCache>,
    tokens: Box<dyn TokenCounter>,
    default_max_tokens: usize,
}

impl ContextEngine {
    pub fn new(workspace_root: PathBuf) -> Self {
        let registry = Arc::new(SessionRegistry::new(workspace_root.clone()));
        let mut engine = Self::with_provider(workspace_root, registry.clone());
        engine.registry = Some(registry);
        engine
    }

    /// Engine over an arbitrary provider; the seam tests use to avoid
    /// spawning real language servers.
    pub fn with_provider(workspace_root: PathBuf, provider: Arc<dyn SymbolProvider>) -> Self {
        let config = Config::get();
        Self {
            workspace_root,
            provider,
            registry: None,
            cache: Mutex::new(ResultCache::new(
                config.cache_capacity_bytes,
                config.cache_ttl(),
            )),
            tokens: Box::new(HeuristicTokenCounter),
            default_max_tokens: config.max_tokens,
        }
    }

    pub fn provider(&self) -> &dyn SymbolProvider {
        self.provider.as_ref()
    }

    pub fn cache_stats(&self) -> crate::model::CacheStats {
        self.cache.lock().unwrap().stats()
    }

    pub fn cache_clear(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Stop every live backend session. No-op for provider-injected engines.
    pub async fn shutdown(&self) {
        if let Some(registry) = &self.registry {
            registry.shutdown_all().await;
        }
    }

    /// Recognize the three query forms, in order: `file:symbol`,
    /// `Class.method` (exactly one dot), bare symbol.
    pub fn parse_query(&self, query: &str) -> QueryTarget {
        let query = query.trim();
        if let Some((file_part, symbol)) = query.rsplit_once(':') {
            if !file_part.is_empty() && !symbol.is_empty() {
                let verbatim = Path::new(file_part);
                let file = if verbatim.exists() {
                    Some(verbatim.to_path_buf())
                } else {
                    let name = verbatim
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| file_part.to_string());
                    scan::find_file_by_name(&self.workspace_root, &name)
                };
                return QueryTarget {
                    file,
                    symbol: symbol.to_string(),
                };
            }
        }
        if query.matches('.').count() == 1 {
            if let Some((_, method)) = query.split_once('.') {
                if !method.is_empty() {
                    return QueryTarget {
                        file: None,
                        symbol: method.to_string(),
                    };
                }
            }
        }
        QueryTarget {
            file: None,
            symbol: query.to_string(),
        }
    }

    /// Textual fallback tier: only consulted when the query pinned no file.
    fn resolve_file(&self, target: &QueryTarget) -> Option<PathBuf> {
        match &target.file {
            Some(file) => Some(file.clone()),
            None => scan::find_declaration(&self.workspace_root, &target.symbol),
        }
    }

    pub async fn get_context(
        &self,
        query: &str,
        scope: ContextScope,
        max_tokens: Option<usize>,
    ) -> Result<ContextPayload> {
        let budget = max_tokens.unwrap_or(self.default_max_tokens);
        let key = fingerprint(query, scope, budget);
        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            debug!("cache hit for {query}");
            return Ok(hit);
        }

        let target = self.parse_query(query);
        let Some(file) = self.resolve_file(&target) else {
            // No resolvable file: a structured empty payload, not an error.
            let payload = ContextPayload {
                symbols: Vec::new(),
                dependencies: Vec::new(),
                references: Vec::new(),
                tokens_saved: 0,
            };
            self.cache.lock().unwrap().set(&key, &payload);
            return Ok(payload);
        };

        let mut symbols = self.extract_symbols(&file, &target.symbol, scope).await?;
        let mut dependencies = self.extract_dependencies(&file, &symbols);
        let mut references = self.extract_references(&symbols).await;

        let raw_tokens = self.raw_token_cost(&file, scope);
        self.trim_to_budget(&mut symbols, &mut dependencies, &mut references, budget);
        let optimized = self.payload_token_cost(&symbols, &dependencies, &references);
        let tokens_saved = raw_tokens.saturating_sub(optimized) as u64;

        let payload = ContextPayload {
            symbols,
            dependencies,
            references,
            tokens_saved,
        };
        self.cache.lock().unwrap().set(&key, &payload);
        Ok(payload)
    }

    /// All document symbols for the file, filtered by scope. An existing
    /// file that yields nothing produces a single Unknown stub so callers
    /// always get at least a placeholder.
    async fn extract_symbols(
        &self,
        file: &Path,
        symbol: &str,
        scope: ContextScope,
    ) -> Result<Vec<SymbolRecord>> {
        let all = self.provider.symbols(file).await?;
        let filtered: Vec<SymbolRecord> = match scope {
            ContextScope::Function => all
                .into_iter()
                .filter(|record| record.name.contains(symbol))
                .collect(),
            ContextScope::Class => all
                .into_iter()
                .filter(|record| record.kind == SymbolKind::Class || record.name.contains(symbol))
                .collect(),
            ContextScope::File => all,
        };
        if filtered.is_empty() && file.exists() {
            return Ok(vec![SymbolRecord {
                name: symbol.to_string(),
                kind: SymbolKind::Unknown,
                file_path: file.to_string_lossy().into_owned(),
                line: 0,
                documentation: String::new(),
            }]);
        }
        Ok(filtered)
    }

    /// Scan the files the symbols point at for import-style statements.
    /// Best effort: an unreadable file is skipped, never fatal.
    fn extract_dependencies(
        &self,
        target: &Path,
        symbols: &[SymbolRecord],
    ) -> Vec<DependencyRecord> {
        let mut files: Vec<PathBuf> = vec![target.to_path_buf()];
        for record in symbols {
            let path = PathBuf::from(&record.file_path);
            if !files.contains(&path) {
                files.push(path);
            }
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for file in files {
            let content = match std::fs::read_to_string(&file) {
                Ok(value) => value,
                Err(err) => {
                    warn!("dependency scan skipping {}: {err}", file.display());
                    continue;
                }
            };
            for (module, summary) in scan_imports(&content) {
                if seen.insert(module.clone()) {
                    out.push(DependencyRecord { module, summary });
                }
            }
        }
        out
    }

    /// Backend references per symbol, capped, own-file excluded. Failures
    /// are swallowed per symbol so one bad lookup never aborts aggregation.
    async fn extract_references(&self, symbols: &[SymbolRecord]) -> Vec<ReferenceRecord> {
        let mut out = Vec::new();
        for record in symbols {
            let file = PathBuf::from(&record.file_path);
            let raw = match self.provider.references(&file, record.line, 0).await {
                Ok(value) => value,
                Err(err) => {
                    warn!("reference lookup failed for {}: {err}", record.name);
                    continue;
                }
            };
            out.extend(
                raw.into_iter()
                    .filter(|reference| reference.file_path != record.file_path)
                    .take(MAX_REFERENCES_PER_SYMBOL),
            );
        }
        out
    }

    fn raw_token_cost(&self, file: &Path, scope: ContextScope) -> usize {
        match scope {
            ContextScope::Function => RAW_TOKENS_FUNCTION,
            ContextScope::Class => RAW_TOKENS_CLASS,
            ContextScope::File => std::fs::read_to_string(file)
                .map(|content| self.tokens.count(&content))
                .unwrap_or(0),
        }
    }

    fn payload_token_cost(
        &self,
        symbols: &[SymbolRecord],
        dependencies: &[DependencyRecord],
        references: &[ReferenceRecord],
    ) -> usize {
        let serialized = serde_json::json!({
            "symbols": symbols,
            "dependencies": dependencies,
            "references": references,
        })
        .to_string();
        self.tokens.count(&serialized)
    }

    /// Shrink the payload until it fits the token budget: references first,
    /// then dependencies, then symbols from the tail. The first symbol is
    /// never dropped, preserving the placeholder guarantee.
    fn trim_to_budget(
        &self,
        symbols: &mut Vec<SymbolRecord>,
        dependencies: &mut Vec<DependencyRecord>,
        references: &mut Vec<ReferenceRecord>,
        budget: usize,
    ) {
        while self.payload_token_cost(symbols, dependencies, references) > budget {
            if references.pop().is_some() {
                continue;
            }
            if dependencies.pop().is_some() {
                continue;
            }
            if symbols.len() > 1 {
                symbols.pop();
                continue;
            }
            break;
        }
    }

    /// Locate every known occurrence of a symbol name. Forces function
    /// scope so name-containing matches are reported.
    pub async fn find_symbol(
        &self,
        name: &str,
        language: Option<&str>,
    ) -> Result<FindSymbolResult> {
        let target = self.parse_query(name);
        let mut locations = Vec::new();
        if let Some(file) = self.resolve_file(&target) {
            let matched = language
                .map(|wanted| scan::detect_language(&file) == Some(wanted))
                .unwrap_or(true);
            if matched {
                let symbols = self
                    .extract_symbols(&file, &target.symbol, ContextScope::Function)
                    .await?;
                locations.extend(symbols.into_iter().map(|record| SymbolLocation {
                    file_path: record.file_path,
                    line: record.line,
                    kind: record.kind,
                }));
            }
        }

        let found = !locations.is_empty();
        let message = if found {
            format!(
                "Found {} location(s) for '{}'",
                locations.len(),
                target.symbol
            )
        } else {
            format!("Symbol '{}' not found", target.symbol)
        };
        Ok(FindSymbolResult {
            found,
            symbol: target.symbol,
            locations,
            message,
        })
    }

    /// Apply line-addressed edits in descending line order so earlier edits
    /// never shift the indices of later ones. Out-of-range edits are skipped
    /// and reported through the applied count.
    pub fn apply_edit(&self, file: &Path, edits: &[Edit]) -> anyhow::Result<ApplyEditResult> {
        let content = crate::util::read_to_string(file)?;
        let had_trailing_newline = content.ends_with('\n');
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

        let mut ordered: Vec<&Edit> = edits.iter().collect();
        ordered.sort_by_key(|edit| std::cmp::Reverse(edit.line()));

        let mut applied = 0usize;
        for edit in ordered {
            let line = edit.line() as usize;
            match edit {
                Edit::Replace { text, .. } if line < lines.len() => {
                    lines[line] = text.clone();
                    applied += 1;
                }
                Edit::Insert { text, .. } if line <= lines.len() => {
                    lines.insert(line, text.clone());
                    applied += 1;
                }
                Edit::Delete { .. } if line < lines.len() => {
                    lines.remove(line);
                    applied += 1;
                }
                _ => debug!("skipping out-of-range edit at line {line}"),
            }
        }

        let mut updated = lines.join("\n");
        if had_trailing_newline && !updated.is_empty() {
            updated.push('\n');
        }
        std::fs::write(file, updated).with_context(|| format!("write {}", file.display()))?;

        Ok(ApplyEditResult {
            file_path: file.to_string_lossy().into_owned(),
            edits_requested: edits.len(),
            edits_applied: applied,
        })
    }

    pub async fn definition(
        &self,
        file: &Path,
        line: u64,
        character: u64,
    ) -> Result<Vec<SourceLocation>> {
        self.provider.definition(file, line, character).await
    }

    pub async fn references(
        &self,
        file: &Path,
        line: u64,
        character: u64,
    ) -> Result<Vec<ReferenceRecord>> {
        self.provider.references(file, line, character).await
    }

    pub async fn symbols(&self, file: &Path) -> Result<Vec<SymbolRecord>> {
        self.provider.symbols(file).await
    }
}

/// The single import-matching regex: ES module imports first so `import x
/// from 'y'` captures the module string, then python `from`/`import`, quoted
/// imports (go, side-effect JS), and CommonJS `require`.
fn import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?m)^\s*(?:import\s+[^'"\n]+?\s+from\s+['"]([^'"]+)['"]|from\s+([A-Za-z_][\w.]*)\s+import|import\s+(?:\w+\s+)?['"]([^'"]+)['"]|import\s+([A-Za-z_][\w.]*)|(?:const|let|var)\s+[^=\n]+=\s*require\(\s*['"]([^'"]+)['"]\s*\))"#,
        )
        .expect("import regex compiles")
    })
}

/// Extract `(module, summary)` pairs from source text, in order of first
/// appearance.
pub(crate) fn scan_imports(content: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for captures in import_regex().captures_iter(content) {
        let module = (1..=5)
            .find_map(|idx| captures.get(idx))
            .map(|m| m.as_str().to_string());
        let Some(module) = module else { continue };
        let summary = captures
            .get(0)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        out.push((module, summary));
    }
    out
}
