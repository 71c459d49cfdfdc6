use std::path::{Path, PathBuf};

use crate::{FerryConfig, FerryResult, LedgerStore};

const DEFAULT_DB_NAME: &str = "ferry.sqlite";

pub fn load_or_init_config(base: &Path) -> FerryResult<FerryConfig> {
    let default_sqlite = base.join(DEFAULT_DB_NAME);
    FerryConfig::load_or_init(base, &default_sqlite)
}

pub async fn open_ledger(base: &Path) -> FerryResult<LedgerStore> {
    let config = load_or_init_config(base)?;
    LedgerStore::connect(&config, base).await
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_DB_NAME)
}

#[cfg(test)]
mod tests {
    use super::{default_sqlite_path, load_or_init_config, open_ledger};
    use tempfile::tempdir;

    #[tokio::test]
    async fn opens_ledger_with_default_config() {
        let dir = tempdir().expect("tempdir");
        let base = dir.path();
        let config = load_or_init_config(base).expect("config");
        assert_eq!(config.backend_name(), "sqlite");
        assert!(base.join("ferry.json").exists());
        let ledger = open_ledger(base).await.expect("open ledger");
        let path = default_sqlite_path(base);
        assert!(path.exists());
        let _ = ledger;
    }

    #[test]
    fn reloads_existing_config() {
        let dir = tempdir().expect("tempdir");
        let first = load_or_init_config(dir.path()).expect("init");
        let second = load_or_init_config(dir.path()).expect("reload");
        assert_eq!(first.backend_name(), second.backend_name());
        assert_eq!(
            second.import_defaults().max_rps,
            first.import_defaults().max_rps
        );
    }
}
