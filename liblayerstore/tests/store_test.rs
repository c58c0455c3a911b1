//! Store tests against plain directory layers. The mount lifecycle
//! test talks to the kernel and skips itself when fuse is not
//! available to the test user.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use liblazy_fs::error::{LazyFsError, Result as FsResult};
use liblazy_fs::fetch::FetchAgent;
use liblayerstore::layout::{CONTENT_DIR, IMAGE_SENTINEL, INDEX_DIR, OVERRIDE_DIR};
use liblayerstore::union::UnionMount;
use liblayerstore::upload::RemoteBlobStore;
use liblayerstore::{
    LayerDriver, LazyLayerStore, Result as StoreResult, StoreError, StoreLayout, chain,
};
use tempfile::TempDir;

const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

macro_rules! mount_or_skip {
    ($call:expr) => {
        match $call {
            Ok(path) => path,
            Err(StoreError::Mount(_, err)) => {
                eprintln!("fuse unavailable ({err}), skipping");
                return;
            }
            Err(err) => panic!("store error: {err}"),
        }
    };
}

/// Fetch agent serving from an in-memory blob map.
struct MockAgent {
    blobs: Vec<(String, Vec<u8>)>,
    calls: AtomicUsize,
}

impl MockAgent {
    fn new(blobs: &[(&str, &[u8])]) -> Arc<Self> {
        Arc::new(MockAgent {
            blobs: blobs
                .iter()
                .map(|(h, b)| (h.to_string(), b.to_vec()))
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchAgent for MockAgent {
    async fn fetch(&self, hash: &str, dir: &Path, _perm: u32) -> FsResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .blobs
            .iter()
            .find(|(h, _)| h == hash)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| LazyFsError::FetchFailed {
                hash: hash.to_string(),
                reason: "blob unknown to agent".to_string(),
            })?;
        fs::write(dir.join(hash), bytes)?;
        Ok(())
    }
}

/// Wrapped driver over plain directories. Writes the `lower`
/// bookkeeping file the way union drivers do, so the chain-root
/// rebuild has something to clean up.
struct DirDriver {
    home: PathBuf,
}

#[async_trait]
impl LayerDriver for DirDriver {
    async fn create(&self, id: &str, _parent: Option<&str>) -> StoreResult<()> {
        fs::create_dir_all(self.home.join(id).join(CONTENT_DIR))?;
        Ok(())
    }

    async fn create_writable(&self, id: &str, parent: Option<&str>) -> StoreResult<()> {
        self.create(id, parent).await
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        fs::remove_dir_all(self.home.join(id))?;
        Ok(())
    }

    async fn apply(&self, id: &str, archive: &Path) -> StoreResult<u64> {
        let layer = self.home.join(id);
        fs::write(layer.join("lower"), b"l/ABC123")?;
        let target = layer.join(CONTENT_DIR);
        fs::create_dir_all(&target)?;
        let mut reader = tar::Archive::new(fs::File::open(archive)?);
        reader.set_preserve_permissions(true);
        reader.unpack(&target)?;
        Ok(64)
    }
}

struct NoopBlobs;

#[async_trait]
impl RemoteBlobStore for NoopBlobs {
    async fn upload_tree(&self, _dir: &Path) -> StoreResult<()> {
        Ok(())
    }
}

struct NoopUnion;

#[async_trait]
impl UnionMount for NoopUnion {
    async fn mount(
        &self,
        _lower: &Path,
        _upper: &Path,
        _work: &Path,
        _merged: &Path,
    ) -> StoreResult<()> {
        Err(StoreError::Union("not available in this test".to_string()))
    }

    async fn unmount(&self, _merged: &Path) -> StoreResult<()> {
        Ok(())
    }
}

struct StoreFixture {
    tmp: TempDir,
    home: PathBuf,
    store: LazyLayerStore,
}

impl StoreFixture {
    fn new() -> Self {
        Self::with_agent(MockAgent::new(&[]))
    }

    fn with_agent(agent: Arc<MockAgent>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("layers");
        let layout = StoreLayout::new(Some(tmp.path().join("store"))).unwrap();
        let store = LazyLayerStore::new(
            home.clone(),
            layout,
            Arc::new(DirDriver { home: home.clone() }),
            agent,
            None,
            Arc::new(NoopBlobs),
            Arc::new(NoopUnion),
        )
        .unwrap();
        StoreFixture { tmp, home, store }
    }

    /// Lays down a complete chain root by hand, the shape a lazy
    /// archive apply leaves behind.
    fn chain_root(&self, id: &str, image: &str) -> PathBuf {
        let layer = self.home.join(id);
        fs::create_dir_all(layer.join(INDEX_DIR)).unwrap();
        fs::create_dir_all(layer.join(CONTENT_DIR)).unwrap();
        fs::create_dir_all(layer.join(OVERRIDE_DIR)).unwrap();
        chain::write_image_name(&layer.join(INDEX_DIR), image).unwrap();
        chain::mark_chain_root(&layer).unwrap();
        layer
    }

    fn placeholder(&self, id: &str, rel: &str, hash: &str) {
        let path = self.home.join(id).join(INDEX_DIR).join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, hash).unwrap();
    }
}

/// Tar archive holding `etc/hosts` as a placeholder, plus the image
/// sentinel when `image` is given.
fn build_archive(dir: &Path, image: Option<&str>) -> PathBuf {
    let path = dir.join("layer.tar");
    let file = fs::File::create(&path).unwrap();
    let mut builder = tar::Builder::new(file);

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_path("etc/").unwrap();
    header.set_mode(0o755);
    header.set_size(0);
    header.set_cksum();
    builder.append(&header, &mut std::io::empty()).unwrap();

    let mut header = tar::Header::new_gnu();
    header.set_path("etc/hosts").unwrap();
    header.set_mode(0o644);
    header.set_size(HASH_A.len() as u64);
    header.set_cksum();
    builder.append(&header, HASH_A.as_bytes()).unwrap();

    if let Some(image) = image {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_path(IMAGE_SENTINEL).unwrap();
        header.set_link_name(image).unwrap();
        header.set_size(0);
        header.set_cksum();
        builder.append(&header, &mut std::io::empty()).unwrap();
    }

    builder.finish().unwrap();
    path
}

#[tokio::test]
async fn create_extends_the_parents_chain() {
    let fixture = StoreFixture::new();
    let root = fixture.chain_root("img-base", "test/app");

    fixture.store.create("mid", Some("img-base")).await.unwrap();
    fixture
        .store
        .create_writable("ctr", Some("mid"))
        .await
        .unwrap();

    assert!(fixture.store.is_lazy("mid"));
    assert!(fixture.store.is_lazy("ctr"));
    assert_eq!(chain::chain_root(&fixture.home.join("ctr")).unwrap(), root);
}

#[tokio::test]
async fn plain_parents_stay_plain() {
    let fixture = StoreFixture::new();

    fixture.store.create("plain", None).await.unwrap();
    fixture
        .store
        .create_writable("child", Some("plain"))
        .await
        .unwrap();

    assert!(fixture.store.exists("plain"));
    assert!(!fixture.store.is_lazy("plain"));
    assert!(!fixture.store.is_lazy("child"));
}

#[tokio::test]
async fn apply_rebuilds_lazy_archives_as_chain_roots() {
    let fixture = StoreFixture::new();
    let archive = build_archive(fixture.tmp.path(), Some("test/app"));

    fixture.store.create("img", None).await.unwrap();
    let size = fixture.store.apply_layer("img", &archive).await.unwrap();

    let layer = fixture.home.join("img");
    assert!(fixture.store.is_lazy("img"));
    assert_eq!(chain::chain_root(&layer).unwrap(), layer);
    assert_eq!(
        chain::image_name(&layer.join(INDEX_DIR)).unwrap(),
        "test/app"
    );
    assert_eq!(
        fs::read_to_string(layer.join(INDEX_DIR).join("etc/hosts")).unwrap(),
        HASH_A
    );
    assert_eq!(fs::read_dir(layer.join(CONTENT_DIR)).unwrap().count(), 0);
    assert!(!layer.join("lower").exists());
    assert_eq!(size, HASH_A.len() as u64);
}

#[tokio::test]
async fn apply_passes_ordinary_archives_through() {
    let fixture = StoreFixture::new();
    let archive = build_archive(fixture.tmp.path(), None);

    fixture.store.create("plain", None).await.unwrap();
    let size = fixture.store.apply_layer("plain", &archive).await.unwrap();

    let layer = fixture.home.join("plain");
    assert!(!fixture.store.is_lazy("plain"));
    assert!(!layer.join(INDEX_DIR).exists());
    assert_eq!(
        fs::read_to_string(layer.join(CONTENT_DIR).join("etc/hosts")).unwrap(),
        HASH_A
    );
    assert!(layer.join("lower").exists());
    assert_eq!(size, 64);
}

#[tokio::test]
async fn acquire_and_release_need_a_chain_marker() {
    let fixture = StoreFixture::new();
    fixture.store.create("plain", None).await.unwrap();

    let err = fixture.store.acquire("plain").await.unwrap_err();
    assert!(matches!(err, StoreError::NotLazy(_)));
    let err = fixture.store.release("plain").await.unwrap_err();
    assert!(matches!(err, StoreError::NotLazy(_)));
}

#[tokio::test]
async fn unbalanced_release_is_tolerated() {
    let fixture = StoreFixture::new();
    fixture.chain_root("img", "test/app");

    fixture.store.release("img").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chain_mount_lifecycle() {
    let agent = MockAgent::new(&[(HASH_A, b"lazy bytes".as_slice())]);
    let fixture = StoreFixture::with_agent(Arc::clone(&agent));
    let root = fixture.chain_root("img", "test/app");
    fixture.placeholder("img", "etc/hosts", HASH_A);
    fixture
        .store
        .create_writable("ctr", Some("img"))
        .await
        .unwrap();
    fs::write(root.join(OVERRIDE_DIR).join("scribble"), b"x").unwrap();

    let mountpoint = mount_or_skip!(fixture.store.acquire("img").await);
    assert_eq!(mountpoint, root.join(CONTENT_DIR));

    // Any member of the chain resolves to the same mount.
    let again = fixture.store.acquire("ctr").await.unwrap();
    assert_eq!(again, mountpoint);

    let through = {
        let path = mountpoint.join("etc/hosts");
        tokio::task::spawn_blocking(move || fs::read(path))
            .await
            .unwrap()
            .unwrap()
    };
    assert_eq!(through, b"lazy bytes");
    assert_eq!(agent.calls(), 1);

    fixture.store.release("ctr").await.unwrap();

    // One consumer left, the mount must still answer.
    let names = {
        let path = mountpoint.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
            fs::read_dir(path)?
                .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                .collect()
        })
        .await
        .unwrap()
        .unwrap()
    };
    assert!(names.contains(&"etc".to_string()));

    fixture.store.release("img").await.unwrap();

    // Torn down: mountpoint and override layer reset to empty.
    assert_eq!(fs::read_dir(&mountpoint).unwrap().count(), 0);
    assert_eq!(fs::read_dir(root.join(OVERRIDE_DIR)).unwrap().count(), 0);
}
