use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::{fs, io::AsyncWriteExt, sync::RwLock};

use crate::error::{BillingError, BillingResult};

/// Object storage the run writes PDFs, reports and run state into.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return the public URL of the object.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> BillingResult<String>;
    async fn get(&self, key: &str) -> BillingResult<Option<Vec<u8>>>;
    async fn list(&self, prefix: &str) -> BillingResult<Vec<String>>;
}

static KEY_ILLEGAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._ -]+").unwrap());
static KEY_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s-]+").unwrap());

const KEY_COMPONENT_MAX: usize = 64;

/// Turn free text (an entity name, typically) into a safe storage-key
/// component: illegal characters stripped, whitespace runs collapsed to a
/// single dash, length capped.
pub fn sanitize_key_component(raw: &str) -> String {
    let stripped = KEY_ILLEGAL.replace_all(raw, "");
    let collapsed = KEY_WHITESPACE.replace_all(stripped.trim(), "-");
    let mut component = collapsed.trim_matches('-').to_ascii_lowercase();
    if component.is_empty() {
        component = "unnamed".to_string();
    }
    component.truncate(KEY_COMPONENT_MAX);
    component
}

/// Local-disk object store. Keys map directly onto paths under the root
/// directory; URLs are built from the configured public base.
pub struct FsObjectStore {
    root: PathBuf,
    public_base: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> BillingResult<String> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| BillingError::storage(format!("create dir for {key}: {e}")))?;
        }
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| BillingError::storage(format!("create {key}: {e}")))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| BillingError::storage(format!("write {key}: {e}")))?;
        Ok(format!("{}/{}", self.public_base, key))
    }

    async fn get(&self, key: &str) -> BillingResult<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BillingError::storage(format!("read {key}: {e}"))),
        }
    }

    async fn list(&self, prefix: &str) -> BillingResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.join(prefix)];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(BillingError::storage(format!(
                        "list {}: {e}",
                        dir.display()
                    )))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| BillingError::storage(format!("list {prefix}: {e}")))?
            {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Some(key) = relative_key(&self.root, &path) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
}

/// In-memory store used by tests and available as a scratch backend.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> BillingResult<String> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), bytes);
        Ok(format!("mem://{key}"))
    }

    async fn get(&self, key: &str) -> BillingResult<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> BillingResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
