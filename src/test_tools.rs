use std::ops::Deref;

use tempfile::TempDir;

use crate::{config::Config, store::Store};

pub struct TmpStore {
    store: Store,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

pub async fn setup() -> TmpStore {
    let path = tempfile::tempdir().unwrap();

    TmpStore {
        store: Store::connect_with(&Config {
            db_path: Some(path.path().join("sluice.db").to_string_lossy().to_string()),
            ..Config::default()
        })
        .await
        .unwrap(),
        tmpdir: path,
    }
}
