use super::errors::*;
use super::protos::*;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Everything that must survive a crash, serialized as one blob so that a
/// single save is atomic.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistentState {
	pub meta: Metadata,
	pub entries: Vec<LogEntry>,
}

impl Default for PersistentState {
	fn default() -> Self {
		PersistentState {
			meta: Metadata::default(),
			entries: vec![],
		}
	}
}

/// Stable storage for a single peer's persistent state. A save must be
/// all-or-nothing; load returns whatever the last successful save wrote.
pub trait Persister: Send + Sync {
	fn save(&self, data: &[u8]) -> Result<()>;

	fn load(&self) -> Result<Option<Vec<u8>>>;
}

/// Keeps the blob in memory. Mainly useful for tests, where it doubles as the
/// surviving storage across a simulated crash/restart.
pub struct MemoryPersister {
	data: Mutex<Option<Vec<u8>>>,
}

impl MemoryPersister {
	pub fn new() -> MemoryPersister {
		MemoryPersister {
			data: Mutex::new(None),
		}
	}

	/// The current contents of storage (what a restart would see).
	pub fn raft_state(&self) -> Option<Vec<u8>> {
		self.data.lock().unwrap().clone()
	}
}

impl Persister for MemoryPersister {
	fn save(&self, data: &[u8]) -> Result<()> {
		*self.data.lock().unwrap() = Some(data.to_vec());
		Ok(())
	}

	fn load(&self) -> Result<Option<Vec<u8>>> {
		Ok(self.raft_state())
	}
}

/// Stores the blob in a single file, made atomic by writing to a temporary
/// file and renaming it over the old one.
pub struct FilePersister {
	path: PathBuf,
}

impl FilePersister {
	pub fn new<P: AsRef<Path>>(path: P) -> FilePersister {
		FilePersister {
			path: path.as_ref().to_owned(),
		}
	}

	fn tmp_path(&self) -> PathBuf {
		let mut p = self.path.as_os_str().to_owned();
		p.push(".tmp");
		PathBuf::from(p)
	}
}

impl Persister for FilePersister {
	fn save(&self, data: &[u8]) -> Result<()> {
		let tmp = self.tmp_path();
		fs::write(&tmp, data)?;
		fs::rename(&tmp, &self.path)?;
		Ok(())
	}

	fn load(&self) -> Result<Option<Vec<u8>>> {
		match fs::read(&self.path) {
			Ok(data) => Ok(Some(data)),
			Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}
}
