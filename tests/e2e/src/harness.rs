//! Per-test engine fixtures

use engram_core::{Engine, EngineConfig};
use tempfile::TempDir;

/// An engine backed by its own temp directory. Dropping the fixture deletes
/// the files.
pub struct TestEngine {
    pub engine: Engine,
    _dir: TempDir,
}

impl TestEngine {
    /// Open a fresh engine with default config
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Open a fresh engine, letting the caller adjust the config first
    pub fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = EngineConfig::new(dir.path().join("engram.db"));
        config.user_email = Some("me@example.com".to_string());
        adjust(&mut config);
        let engine = Engine::init(config).expect("engine init");
        Self { engine, _dir: dir }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
