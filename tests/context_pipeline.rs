use ctxls::context::ContextEngine;
use ctxls::error::Result;
use ctxls::model::{
    ContextScope, ReferenceRecord, SourceLocation, SymbolKind, SymbolRecord,
};
use ctxls::registry::SymbolProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory provider so pipeline tests never spawn a language server.
struct FakeProvider {
    symbols: Vec<SymbolRecord>,
    references: Vec<ReferenceRecord>,
    symbol_calls: AtomicUsize,
}

impl FakeProvider {
    fn new(symbols: Vec<SymbolRecord>, references: Vec<ReferenceRecord>) -> Self {
        Self {
            symbols,
            references,
            symbol_calls: AtomicUsize::new(0),
        }
    }

    fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

#[async_trait::async_trait]
impl SymbolProvider for FakeProvider {
    async fn symbols(&self, _file: &Path) -> Result<Vec<SymbolRecord>> {
        self.symbol_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.symbols.clone())
    }

    async fn references(
        &self,
        _file: &Path,
        _line: u64,
        _character: u64,
    ) -> Result<Vec<ReferenceRecord>> {
        Ok(self.references.clone())
    }

    async fn definition(
        &self,
        _file: &Path,
        _line: u64,
        _character: u64,
    ) -> Result<Vec<SourceLocation>> {
        Ok(Vec::new())
    }
}

fn workspace_with_auth() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("auth.py");
    std::fs::write(
        &file,
        "import hashlib\nfrom os import path\n\nclass UserService:\n    def authenticate(self, user):\n        return True\n",
    )
    .unwrap();
    (dir, file)
}

fn symbol(name: &str, kind: SymbolKind, file: &Path, line: u64) -> SymbolRecord {
    SymbolRecord {
        name: name.to_string(),
        kind,
        file_path: file.to_string_lossy().into_owned(),
        line,
        documentation: String::new(),
    }
}

#[tokio::test]
async fn get_context_assembles_symbols_dependencies_and_references() {
    let (dir, file) = workspace_with_auth();
    let provider = Arc::new(FakeProvider::new(
        vec![
            symbol("UserService", SymbolKind::Class, &file, 3),
            symbol("authenticate", SymbolKind::Method, &file, 4),
        ],
        vec![ReferenceRecord {
            file_path: dir.path().join("api.py").to_string_lossy().into_owned(),
            line: 12,
            context: "service.authenticate(user)".into(),
        }],
    ));
    let engine = ContextEngine::with_provider(dir.path().to_path_buf(), provider);

    let query = format!("{}:UserService", file.display());
    let payload = engine
        .get_context(&query, ContextScope::File, None)
        .await
        .unwrap();

    assert_eq!(payload.symbols.len(), 2);
    assert_eq!(payload.symbols[0].kind, SymbolKind::Class);

    let modules: Vec<&str> = payload
        .dependencies
        .iter()
        .map(|d| d.module.as_str())
        .collect();
    assert_eq!(modules, vec!["hashlib", "os"]);

    assert!(!payload.references.is_empty());
    assert!(payload.references.iter().all(|r| r.file_path.ends_with("api.py")));
}

#[tokio::test]
async fn references_are_capped_and_exclude_the_defining_file() {
    let (dir, file) = workspace_with_auth();
    let own = file.to_string_lossy().into_owned();
    let mut raw = Vec::new();
    // Two references inside the defining file, eight outside.
    raw.push(ReferenceRecord {
        file_path: own.clone(),
        line: 1,
        context: "self-reference".into(),
    });
    for idx in 0..8 {
        raw.push(ReferenceRecord {
            file_path: dir
                .path()
                .join(format!("caller{idx}.py"))
                .to_string_lossy()
                .into_owned(),
            line: idx,
            context: format!("call site {idx}"),
        });
    }
    raw.push(ReferenceRecord {
        file_path: own.clone(),
        line: 5,
        context: "another self-reference".into(),
    });

    let provider = Arc::new(FakeProvider::new(
        vec![symbol("authenticate", SymbolKind::Method, &file, 4)],
        raw,
    ));
    let engine = ContextEngine::with_provider(dir.path().to_path_buf(), provider);

    let query = format!("{}:authenticate", file.display());
    let payload = engine
        .get_context(&query, ContextScope::Function, None)
        .await
        .unwrap();

    assert_eq!(payload.references.len(), 5);
    assert!(payload.references.iter().all(|r| r.file_path != own));
}

#[tokio::test]
async fn empty_extraction_on_existing_file_yields_a_stub() {
    let (dir, file) = workspace_with_auth();
    let engine =
        ContextEngine::with_provider(dir.path().to_path_buf(), Arc::new(FakeProvider::empty()));

    let query = format!("{}:Nonexistent", file.display());
    let payload = engine
        .get_context(&query, ContextScope::Function, None)
        .await
        .unwrap();

    assert_eq!(payload.symbols.len(), 1);
    assert_eq!(payload.symbols[0].kind, SymbolKind::Unknown);
    assert_eq!(payload.symbols[0].name, "Nonexistent");
}

#[tokio::test]
async fn unresolvable_query_returns_an_empty_payload_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine =
        ContextEngine::with_provider(dir.path().to_path_buf(), Arc::new(FakeProvider::empty()));

    let payload = engine
        .get_context("CompletelyUnknownThing", ContextScope::Function, None)
        .await
        .unwrap();
    assert!(payload.symbols.is_empty());
    assert!(payload.dependencies.is_empty());
    assert!(payload.references.is_empty());
    assert_eq!(payload.tokens_saved, 0);
}

#[tokio::test]
async fn second_identical_query_is_served_from_the_cache() {
    let (dir, file) = workspace_with_auth();
    let provider = Arc::new(FakeProvider::new(
        vec![symbol("UserService", SymbolKind::Class, &file, 3)],
        Vec::new(),
    ));
    let engine = ContextEngine::with_provider(dir.path().to_path_buf(), provider.clone());

    let query = format!("{}:UserService", file.display());
    let first = engine
        .get_context(&query, ContextScope::Class, Some(2_000))
        .await
        .unwrap();
    let second = engine
        .get_context(&query, ContextScope::Class, Some(2_000))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(provider.symbol_calls.load(Ordering::SeqCst), 1);
    let stats = engine.cache_stats();
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn tokens_saved_saturates_when_payload_exceeds_raw_estimate() {
    let (dir, file) = workspace_with_auth();
    let make_provider = || {
        Arc::new(FakeProvider::new(
            vec![symbol("UserService", SymbolKind::Class, &file, 3)],
            Vec::new(),
        ))
    };
    let query = format!("{}:UserService", file.display());

    // Function scope: flat raw estimate well above the tiny payload.
    let engine = ContextEngine::with_provider(dir.path().to_path_buf(), make_provider());
    let payload = engine
        .get_context(&query, ContextScope::Function, None)
        .await
        .unwrap();
    assert!(payload.tokens_saved > 0);

    // File scope over a tiny file: the serialized payload costs more than
    // the raw text, so the saving saturates at zero instead of wrapping.
    let engine = ContextEngine::with_provider(dir.path().to_path_buf(), make_provider());
    let payload = engine
        .get_context(&query, ContextScope::File, None)
        .await
        .unwrap();
    assert_eq!(payload.tokens_saved, 0);
}

#[tokio::test]
async fn tight_budget_trims_references_before_symbols() {
    let (dir, file) = workspace_with_auth();
    let references: Vec<ReferenceRecord> = (0..4)
        .map(|idx| ReferenceRecord {
            file_path: dir
                .path()
                .join(format!("caller{idx}.py"))
                .to_string_lossy()
                .into_owned(),
            line: idx,
            context: "x".repeat(200),
        })
        .collect();
    let provider = Arc::new(FakeProvider::new(
        vec![symbol("UserService", SymbolKind::Class, &file, 3)],
        references,
    ));
    let engine = ContextEngine::with_provider(dir.path().to_path_buf(), provider);

    let query = format!("{}:UserService", file.display());
    let payload = engine
        .get_context(&query, ContextScope::Class, Some(120))
        .await
        .unwrap();

    assert!(payload.references.len() < 4, "references were not trimmed");
    assert!(!payload.symbols.is_empty(), "first symbol must survive");
}

#[tokio::test]
async fn find_symbol_reports_locations_and_count() {
    let (dir, file) = workspace_with_auth();
    let provider = Arc::new(FakeProvider::new(
        vec![symbol("authenticate", SymbolKind::Method, &file, 4)],
        Vec::new(),
    ));
    let engine = ContextEngine::with_provider(dir.path().to_path_buf(), provider);

    let result = engine.find_symbol("authenticate", None).await.unwrap();
    assert!(result.found);
    assert_eq!(result.locations.len(), 1);
    assert_eq!(result.locations[0].line, 4);
    assert!(result.message.contains("1 location"));
}

#[tokio::test]
async fn find_symbol_not_found_is_structured() {
    let dir = tempfile::tempdir().unwrap();
    let engine =
        ContextEngine::with_provider(dir.path().to_path_buf(), Arc::new(FakeProvider::empty()));

    let result = engine.find_symbol("GhostSymbol", None).await.unwrap();
    assert!(!result.found);
    assert!(result.locations.is_empty());
    assert!(result.message.contains("not found"));
}

#[tokio::test]
async fn find_symbol_language_filter_excludes_mismatches() {
    let (dir, file) = workspace_with_auth();
    let provider = Arc::new(FakeProvider::new(
        vec![symbol("authenticate", SymbolKind::Method, &file, 4)],
        Vec::new(),
    ));
    let engine = ContextEngine::with_provider(dir.path().to_path_buf(), provider);

    let result = engine.find_symbol("authenticate", Some("go")).await.unwrap();
    assert!(!result.found);
    let result = engine
        .find_symbol("authenticate", Some("python"))
        .await
        .unwrap();
    assert!(result.found);
}
