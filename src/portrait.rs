use crate::formkey::FormKey;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc,
    },
    thread,
    time::Duration,
};

const MUGSHOT_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Mugshot of `npc` inside one image folder: `<plugin>/<id:08X>.png` (or jpg),
/// matched without regard to case.
pub fn find_mugshot(image_paths: &[PathBuf], npc: &FormKey) -> Option<PathBuf> {
    let plugin = npc.mod_key.name();
    let id = format!("{:08X}", npc.id);
    image_paths.iter().find_map(|root| {
        let dir = find_entry(root, plugin)?;
        fs::read_dir(&dir).ok()?.flatten().map(|entry| entry.path()).find(|path| {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            stem.eq_ignore_ascii_case(&id)
                && MUGSHOT_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
        })
    })
}

fn find_entry(root: &Path, name: &str) -> Option<PathBuf> {
    fs::read_dir(root)
        .ok()?
        .flatten()
        .find(|entry| entry.file_name().to_string_lossy().eq_ignore_ascii_case(name))
        .map(|entry| entry.path())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortraitMessage {
    pub generation: u64,
    pub npc: FormKey,
    pub path: Option<PathBuf>,
}

/// Background mugshot lookups. Every focus change starts a new generation;
/// lookups from older generations are abandoned, never awaited.
pub struct PortraitFetcher {
    generation: Arc<AtomicU64>,
    tx: Sender<PortraitMessage>,
    rx: Receiver<PortraitMessage>,
}

impl Default for PortraitFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PortraitFetcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            tx,
            rx,
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn focus(&self, npc: FormKey, image_paths: Vec<PathBuf>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.generation.clone();
        let tx = self.tx.clone();
        thread::spawn(move || {
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            let path = find_mugshot(&image_paths, &npc);
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            let _ = tx.send(PortraitMessage {
                generation,
                npc,
                path,
            });
        });
        generation
    }

    /// Latest result for the current focus, dropping stale ones.
    pub fn poll(&self) -> Option<PortraitMessage> {
        let mut latest = None;
        loop {
            match self.rx.try_recv() {
                Ok(message) if message.generation == self.current_generation() => {
                    latest = Some(message)
                }
                Ok(_) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        latest
    }

    pub fn wait(&self, timeout: Duration) -> Option<PortraitMessage> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(message) if message.generation == self.current_generation() => {
                    return Some(message)
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::fixtures::fk;

    #[test]
    fn finds_mugshots_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("skyrim.esm");
        fs::create_dir_all(&plugin_dir).unwrap();
        fs::write(plugin_dir.join("00001234.PNG"), b"png").unwrap();
        fs::write(plugin_dir.join("00001235.txt"), b"nope").unwrap();

        let roots = vec![dir.path().join("missing"), dir.path().to_path_buf()];
        assert_eq!(
            find_mugshot(&roots, &fk("001234:Skyrim.esm")),
            Some(plugin_dir.join("00001234.PNG"))
        );
        assert_eq!(find_mugshot(&roots, &fk("001235:Skyrim.esm")), None);
    }

    #[test]
    fn only_current_focus_is_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("Skyrim.esm");
        fs::create_dir_all(&plugin_dir).unwrap();
        fs::write(plugin_dir.join("00001235.jpg"), b"jpg").unwrap();

        let fetcher = PortraitFetcher::new();
        let first = fetcher.focus(fk("001234:Skyrim.esm"), vec![dir.path().to_path_buf()]);
        let second = fetcher.focus(fk("001235:Skyrim.esm"), vec![dir.path().to_path_buf()]);
        assert!(second > first);

        let message = fetcher.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(message.generation, second);
        assert_eq!(message.npc, fk("001235:Skyrim.esm"));
        assert_eq!(message.path, Some(plugin_dir.join("00001235.jpg")));
        assert!(fetcher.poll().is_none());
    }
}
