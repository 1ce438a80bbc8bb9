//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use mapcontent::digest::sha1_bytes;
use mapcontent::{
    Collaborators, Compression, Config, ContentItem, ContentManager, ContentType,
    ContentTypeRegistry, DigestStore, GeoPoint, ItemSource, MemoryKeyValueStore,
    MemoryTransport, Region, Result, Transport,
};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const ROOT_URL: &str = "https://maps.example/root.json";
pub const TEST_MAP: &str = "test-map";

pub const KARELIA: &str = "karelia
1
   30.0   60.0
   38.0   60.0
   38.0   66.0
   30.0   66.0
END
END
";

pub const MOSCOW: &str = "moscow
1
   36.0   55.0
   39.0   55.0
   39.0   57.0
   36.0   57.0
END
END
";

/// Package body the mock type can't extract a region from but claims to
/// cover every point with
pub const EVERYWHERE: &str = "EVERYWHERE";

/// Package body whose unpacking fails
pub const BROKEN: &str = "BROKEN";

/// Content type whose packages are plain polygon files
pub struct CountingContentType {
    pub unpacks: Arc<AtomicUsize>,
}

impl ContentType for CountingContentType {
    fn name(&self) -> &str {
        TEST_MAP
    }

    fn extension(&self) -> &str {
        ".tmap"
    }

    fn extract_region(&self, _item: &ContentItem, package: &Path) -> Option<Region> {
        let text = fs::read_to_string(package).ok()?;
        Region::parse_str(&text).ok()
    }

    fn check_region(&self, _item: &ContentItem, package: &Path, _point: GeoPoint) -> bool {
        fs::read_to_string(package).is_ok_and(|text| text == EVERYWHERE)
    }

    fn unpack(&self, _item: &ContentItem, package: &Path, dest: &Path) -> io::Result<()> {
        self.unpacks.fetch_add(1, Ordering::SeqCst);
        let text = fs::read_to_string(package)?;
        fs::write(dest.join("partial"), b"1")?;
        if text == BROKEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "corrupt package"));
        }
        fs::copy(package, dest.join("dataset"))?;
        Ok(())
    }

    fn region_bundle(&self, unpacked: &Path) -> Option<PathBuf> {
        let dir = unpacked.join("regions");
        dir.is_dir().then_some(dir)
    }
}

/// A storage root, an in-memory catalog and the persistent collaborators a
/// manager is rebuilt from
pub struct Fixture {
    pub dir: TempDir,
    pub transport: Arc<MemoryTransport>,
    pub prefs: Arc<MemoryKeyValueStore>,
    pub digests: DigestStore,
    pub unpacks: Arc<AtomicUsize>,
    pub catalog: Vec<serde_json::Value>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            transport: Arc::new(MemoryTransport::new()),
            prefs: Arc::new(MemoryKeyValueStore::new()),
            digests: DigestStore::temporary().unwrap(),
            unpacks: Arc::new(AtomicUsize::new(0)),
            catalog: Vec::new(),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("root")
    }

    pub fn config(&self) -> Config {
        Config {
            storage_root: self.root(),
            catalog_urls: vec![ROOT_URL.to_string()],
            progress_step_bytes: 4,
            ..Config::default()
        }
    }

    pub fn manager(&self) -> ContentManager {
        self.manager_with(self.config())
    }

    pub fn manager_with(&self, config: Config) -> ContentManager {
        self.build(config, self.transport.clone())
    }

    pub fn manager_with_transport(&self, transport: Arc<dyn Transport>) -> ContentManager {
        self.build(self.config(), transport)
    }

    fn build(&self, config: Config, transport: Arc<dyn Transport>) -> ContentManager {
        let mut registry = ContentTypeRegistry::with_defaults();
        registry.register(Arc::new(CountingContentType {
            unpacks: self.unpacks.clone(),
        }));

        ContentManager::new(
            config,
            Collaborators {
                registry,
                preferences: self.prefs.clone(),
                digests: self.digests.clone(),
                transport,
            },
        )
        .unwrap()
    }

    /// Publish a package in the catalog under its own hash
    pub fn publish(&mut self, name: &str, body: &str) {
        let hash = sha1_bytes(body.as_bytes());
        self.publish_as(name, body, &hash);
    }

    /// Publish a package with an arbitrary declared hash
    pub fn publish_as(&mut self, name: &str, body: &str, hash: &str) {
        self.transport
            .insert(&format!("https://maps.example/pkg/{name}"), body.as_bytes().to_vec());
        self.catalog.retain(|e| e["name"] != name);
        self.catalog.push(serde_json::json!({
            "name": name,
            "type": TEST_MAP,
            "hash": hash,
            "description": name,
            "region_id": name,
            "url": format!("pkg/{name}"),
            "size": body.len(),
        }));
        self.write_catalog();
    }

    pub fn write_catalog(&self) {
        self.transport.insert(
            ROOT_URL,
            serde_json::json!({ "items": self.catalog }).to_string(),
        );
    }

    /// Refresh the remote list and download `name`
    pub fn download(&self, manager: &ContentManager, name: &str) -> ContentItem {
        manager
            .refresh_remote_content_list(&[ROOT_URL.to_string()])
            .unwrap();
        let remote = manager
            .remote_items()
            .iter()
            .find(|i| i.name == name)
            .cloned()
            .unwrap();
        manager
            .download_content_item(&remote, None, Default::default())
            .unwrap()
    }
}

pub fn unpacks(fixture: &Fixture) -> usize {
    fixture.unpacks.load(Ordering::SeqCst)
}

/// Remote item served at `https://maps.example/pkg/<name>`
pub fn remote_item(name: &str, body: &str) -> ContentItem {
    ContentItem {
        name: name.to_string(),
        content_type: TEST_MAP.to_string(),
        hash: sha1_bytes(body.as_bytes()),
        description: String::new(),
        region_id: None,
        source: ItemSource::Remote {
            url: format!("https://maps.example/pkg/{name}"),
            size: body.len() as u64,
            compression: Compression::None,
        },
    }
}

/// Serves one body whose first read blocks until the test releases it
pub struct GatedTransport {
    body: Vec<u8>,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
    opened: Mutex<Option<mpsc::Sender<()>>>,
}

impl GatedTransport {
    /// The transport, the sender releasing the first read, and a receiver
    /// signalled once the body was opened
    pub fn new(body: &str) -> (Arc<Self>, mpsc::Sender<()>, mpsc::Receiver<()>) {
        let (release, gate) = mpsc::channel();
        let (opened_tx, opened_rx) = mpsc::channel();
        let transport = Arc::new(Self {
            body: body.as_bytes().to_vec(),
            gate: Mutex::new(Some(gate)),
            opened: Mutex::new(Some(opened_tx)),
        });
        (transport, release, opened_rx)
    }
}

struct GatedReader {
    body: io::Cursor<Vec<u8>>,
    gate: Option<mpsc::Receiver<()>>,
}

impl Read for GatedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(gate) = self.gate.take() {
            gate.recv().ok();
        }
        // One byte at a time so the stream is never drained in a single read
        let len = buf.len().min(1);
        self.body.read(&mut buf[..len])
    }
}

impl Transport for GatedTransport {
    fn open(&self, _url: &str) -> Result<Box<dyn Read + Send>> {
        if let Some(opened) = self.opened.lock().take() {
            opened.send(()).ok();
        }
        Ok(Box::new(GatedReader {
            body: io::Cursor::new(self.body.clone()),
            gate: self.gate.lock().take(),
        }))
    }
}
