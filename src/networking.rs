//! Remote object storage for benchmark downloads and checkpoint uploads.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::blocking::Client;

use crate::error::{Result, SimsError};

/// A flat key/value object store addressed by `/`-separated remote names.
pub trait RemoteStore {
    /// Fetch `remote_name` into `dest`, replacing any existing file.
    fn download(&self, remote_name: &str, dest: &Path) -> Result<()>;

    /// Store the contents of `src` under `remote_name`.
    fn upload(&self, src: &Path, remote_name: &str) -> Result<()>;
}

/// Object store reached over plain HTTP: `GET`/`PUT <base_url>/<remote_name>`.
#[derive(Debug, Clone)]
pub struct HttpStore {
    base_url: String,
    client: Client,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(SimsError::InvalidConfig(format!(
                "remote url '{base_url}' must start with http:// or https://"
            )));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self { base_url, client })
    }

    pub fn url(&self, remote_name: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            remote_name.trim_start_matches('/')
        )
    }
}

impl RemoteStore for HttpStore {
    fn download(&self, remote_name: &str, dest: &Path) -> Result<()> {
        let url = self.url(remote_name);
        info!("downloading {url} -> {}", dest.display());

        let mut response = self.client.get(&url).send()?.error_for_status()?;
        let partial = partial_path(dest);
        let written = File::create(&partial)
            .map_err(|e| SimsError::io(&partial, e))
            .and_then(|mut file| Ok(response.copy_to(&mut file)?))
            .and_then(|bytes| {
                fs::rename(&partial, dest).map_err(|e| SimsError::io(dest, e))?;
                Ok(bytes)
            });
        match written {
            Ok(bytes) => {
                debug!("downloaded {bytes} bytes");
                Ok(())
            }
            Err(e) => {
                discard_partial(&partial);
                Err(e)
            }
        }
    }

    fn upload(&self, src: &Path, remote_name: &str) -> Result<()> {
        let url = self.url(remote_name);
        let file = File::open(src).map_err(|e| SimsError::io(src, e))?;
        self.client.put(&url).body(file).send()?.error_for_status()?;
        debug!("uploaded {} -> {url}", src.display());
        Ok(())
    }
}

/// Sibling of `dest` that receives the transfer until it completes.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn discard_partial(partial: &Path) {
    if partial.exists() {
        if let Err(e) = fs::remove_file(partial) {
            warn!("could not remove {}: {e}", partial.display());
        }
    }
}

/// Directory-backed store, for offline runs and tests.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, remote_name: &str) -> PathBuf {
        self.root.join(remote_name)
    }
}

impl RemoteStore for LocalStore {
    fn download(&self, remote_name: &str, dest: &Path) -> Result<()> {
        let src = self.path_of(remote_name);
        if !src.is_file() {
            return Err(SimsError::MissingFile(src));
        }
        fs::copy(&src, dest).map_err(|e| SimsError::io(dest, e))?;
        Ok(())
    }

    fn upload(&self, src: &Path, remote_name: &str) -> Result<()> {
        let dest = self.path_of(remote_name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| SimsError::io(parent, e))?;
        }
        fs::copy(src, &dest).map_err(|e| SimsError::io(&dest, e))?;
        Ok(())
    }
}

/// Make sure every file in `files` exists under `dir`, downloading the
/// missing ones from `<prefix>/<file>`. Returns how many were downloaded.
pub fn ensure_files(
    store: Option<&dyn RemoteStore>,
    dir: &Path,
    prefix: &str,
    files: &[&str],
) -> Result<usize> {
    let mut downloaded = 0;
    for file in files {
        let dest = dir.join(file);
        if dest.is_file() {
            debug!("{} already present", dest.display());
            continue;
        }
        let store = store.ok_or_else(|| SimsError::NoRemoteStore(dest.display().to_string()))?;
        info!("downloading {file}");
        store.download(&format!("{prefix}/{file}"), &dest)?;
        downloaded += 1;
    }
    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingStore {
        downloads: Cell<usize>,
    }

    impl RemoteStore for CountingStore {
        fn download(&self, _remote_name: &str, dest: &Path) -> Result<()> {
            self.downloads.set(self.downloads.get() + 1);
            fs::write(dest, b"x").map_err(|e| SimsError::io(dest, e))
        }

        fn upload(&self, _src: &Path, _remote_name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn present_files_are_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "x").unwrap();
        fs::write(dir.path().join("b.parquet"), "x").unwrap();

        let store = CountingStore::default();
        let n = ensure_files(Some(&store), dir.path(), "p", &["a.csv", "b.parquet"]).unwrap();
        assert_eq!(n, 0);
        assert_eq!(store.downloads.get(), 0);
    }

    #[test]
    fn missing_files_are_downloaded_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "x").unwrap();

        let store = CountingStore::default();
        let n = ensure_files(Some(&store), dir.path(), "p", &["a.csv", "b.parquet"]).unwrap();
        assert_eq!(n, 1);
        assert!(dir.path().join("b.parquet").is_file());

        ensure_files(Some(&store), dir.path(), "p", &["a.csv", "b.parquet"]).unwrap();
        assert_eq!(store.downloads.get(), 1);
    }

    #[test]
    fn missing_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_files(None, dir.path(), "p", &["a.csv"]).unwrap_err();
        assert!(matches!(err, SimsError::NoRemoteStore(_)));
    }

    #[test]
    fn local_store_round_trip() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let store = LocalStore::new(remote.path());

        let src = local.path().join("ckpt.json");
        fs::write(&src, "{}").unwrap();
        store.upload(&src, "model_checkpoints/run/ckpt.json").unwrap();
        assert!(remote.path().join("model_checkpoints/run/ckpt.json").is_file());

        let dest = local.path().join("copy.json");
        store.download("model_checkpoints/run/ckpt.json", &dest).unwrap();
        assert_eq!(fs::read_to_string(dest).unwrap(), "{}");

        let missing = store.download("nope", &local.path().join("n"));
        assert!(matches!(missing, Err(SimsError::MissingFile(_))));
    }

    #[test]
    fn partial_downloads_keep_the_full_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let csv = partial_path(&dir.path().join("human.csv"));
        let h5ad = partial_path(&dir.path().join("human.h5ad"));
        assert_eq!(csv.file_name().unwrap(), "human.csv.part");
        assert_ne!(csv, h5ad);

        fs::write(&csv, "half").unwrap();
        discard_partial(&csv);
        assert!(!csv.exists());
    }

    #[test]
    fn failed_http_download_leaves_no_partial_file() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            use std::io::{Read, Write};
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request);
            // Promise more bytes than are sent, then hang up.
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort")
                .unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("human.h5ad");
        let store = HttpStore::new(format!("http://127.0.0.1:{port}")).unwrap();
        assert!(store.download("jlehrer/human.h5ad", &dest).is_err());
        server.join().unwrap();

        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn http_urls_are_joined_with_one_slash() {
        let store = HttpStore::new("https://example.org/bucket/").unwrap();
        assert_eq!(store.url("/a/b.csv"), "https://example.org/bucket/a/b.csv");
        assert!(HttpStore::new("ftp://x").is_err());
    }
}
