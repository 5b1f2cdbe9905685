//! Priority-layered configuration file store
//!
//! Each construct lives in its own file named `<priority>-<tag>-<identity>.<ext>`.
//! The backend reads the directory in lexical order, so the priority prefix
//! decides load order and parents are always defined before their children.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use regex::Regex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use safenet_core::{
    priority_for, priority_for_parent, validate_name, ConstructKind, NetworkConstruct,
    ParentInfo, Result, StoreError,
};

use crate::settings::EngineSettings;

/// A construct bound to its file in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFileHandle {
    pub path: PathBuf,
    pub construct: NetworkConstruct,
    pub parent: ParentInfo,
    pub priority: u8,
}

impl ConfigFileHandle {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Writer for the layered configuration store
#[derive(Debug, Clone)]
pub struct LayeredConfigWriter {
    dir: PathBuf,
    tag: String,
    extension: String,
    file_mode: Option<u32>,
    legacy_prefixes: Vec<u8>,
    managed: Option<Regex>,
}

impl LayeredConfigWriter {
    /// Writer over `dir` with the default naming settings
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        let settings = EngineSettings {
            config_dir: dir.as_ref().to_path_buf(),
            ..EngineSettings::default()
        };
        Self::from_settings(&settings)
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            dir: settings.config_dir.clone(),
            tag: settings.file_tag.clone(),
            extension: settings.file_extension.clone(),
            file_mode: settings.file_mode,
            legacy_prefixes: settings.legacy_prefixes.clone(),
            managed: managed_pattern(&settings.file_tag, &settings.file_extension),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self.managed = managed_pattern(&self.tag, &self.extension);
        self
    }

    pub fn with_file_mode(mut self, mode: Option<u32>) -> Self {
        self.file_mode = mode;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fixed priority band for `kind` placed on `parent_kind`
    pub fn priority_for(kind: ConstructKind, parent_kind: Option<ConstructKind>) -> u8 {
        priority_for(kind, parent_kind)
    }

    /// Sortable file name for a construct
    pub fn filename_for(&self, identity: &str, kind: ConstructKind, parent: &ParentInfo) -> String {
        self.filename_with_prefix(priority_for_parent(kind, parent), identity)
    }

    /// Bind a construct to its file
    pub fn handle_for(
        &self,
        construct: &NetworkConstruct,
        parent: ParentInfo,
    ) -> Result<ConfigFileHandle> {
        validate_name(&construct.name)?;
        let priority = priority_for_parent(construct.kind(), &parent);
        let path = self
            .dir
            .join(self.filename_with_prefix(priority, &construct.name));

        Ok(ConfigFileHandle {
            path,
            construct: construct.clone(),
            parent,
            priority,
        })
    }

    /// Persist `content` for `handle` atomically.
    ///
    /// The content goes to a hidden temporary file in the same directory which
    /// is then renamed over the target, so readers see either the old or the
    /// new file, never a partial one.
    pub async fn write(&self, handle: &ConfigFileHandle, content: &str) -> Result<()> {
        info!(
            "Writing {} {} to {}",
            handle.construct.kind(),
            handle.construct.name,
            handle.path.display()
        );
        self.write_atomic(&handle.path, content.as_bytes()).await
    }

    /// Remove every file `identity` could have been written under, for any
    /// parent variant and for the legacy naming scheme. Missing files and
    /// individual removal failures are tolerated; the returned list holds
    /// the files actually removed.
    pub async fn cleanup_stale_files(
        &self,
        identity: &str,
        kind: ConstructKind,
    ) -> Result<Vec<PathBuf>> {
        validate_name(identity)?;

        let mut removed = Vec::new();
        for candidate in self.candidate_paths(identity, kind) {
            match fs::remove_file(&candidate).await {
                Ok(()) => {
                    debug!("Removed {}", candidate.display());
                    removed.push(candidate);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", candidate.display(), e),
            }
        }

        if !removed.is_empty() {
            info!(
                "Cleaned up {} configuration file(s) for {}",
                removed.len(),
                identity
            );
        }
        Ok(removed)
    }

    /// Remove the files of a deleted construct
    pub async fn remove(&self, construct: &NetworkConstruct) -> Result<Vec<PathBuf>> {
        self.cleanup_stale_files(&construct.name, construct.kind())
            .await
    }

    /// Every path `identity` may occupy, without duplicates
    pub fn candidate_paths(&self, identity: &str, kind: ConstructKind) -> Vec<PathBuf> {
        let mut names: Vec<String> = ParentInfo::variants()
            .iter()
            .map(|parent| self.filename_for(identity, kind, parent))
            .collect();
        names.extend(
            self.legacy_prefixes
                .iter()
                .map(|prefix| self.filename_with_prefix(*prefix, identity)),
        );

        let mut paths: Vec<PathBuf> = Vec::with_capacity(names.len());
        for name in names {
            let path = self.dir.join(name);
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    /// Whether a file name belongs to this store
    pub fn is_managed(&self, file_name: &str) -> bool {
        self.managed
            .as_ref()
            .is_some_and(|re| re.is_match(file_name))
    }

    /// Identity encoded in a managed file name
    pub fn identity_of(&self, file_name: &str) -> Option<String> {
        self.managed
            .as_ref()?
            .captures(file_name)
            .and_then(|c| c.name("identity"))
            .map(|m| m.as_str().to_string())
    }

    /// Managed files currently in the store, in load order
    pub async fn managed_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if self.is_managed(name) {
                    files.push(entry.path());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    pub(crate) async fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        let store_err = |source: std::io::Error| StoreError::Write {
            path: path.display().to_string(),
            source,
        };

        let parent = path.parent().unwrap_or(&self.dir);
        fs::create_dir_all(parent).await.map_err(store_err)?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("config");
        let temp = parent.join(format!(".{}.tmp-{}", file_name, std::process::id()));

        let result: std::io::Result<()> = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
            drop(file);

            self.apply_mode(&temp).await;
            fs::rename(&temp, path).await
        }
        .await;

        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_file(&temp).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove temporary file {}: {}", temp.display(), cleanup);
                }
            }
            return Err(store_err(e).into());
        }

        Ok(())
    }

    #[cfg(unix)]
    async fn apply_mode(&self, path: &Path) {
        use std::os::unix::fs::PermissionsExt;

        let Some(mode) = self.file_mode else {
            return;
        };
        if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await {
            warn!(
                "Could not set permissions {:o} on {}: {}",
                mode,
                path.display(),
                e
            );
        }
    }

    #[cfg(not(unix))]
    async fn apply_mode(&self, _path: &Path) {}

    fn filename_with_prefix(&self, priority: u8, identity: &str) -> String {
        format!("{:02}-{}-{}.{}", priority, self.tag, identity, self.extension)
    }
}

fn managed_pattern(tag: &str, extension: &str) -> Option<Regex> {
    let pattern = format!(
        r"^\d{{2}}-{}-(?P<identity>[A-Za-z][A-Za-z0-9_.\-]*)\.{}$",
        regex::escape(tag),
        regex::escape(extension)
    );
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("Invalid managed file pattern {}: {}", pattern, e);
            None
        }
    }
}
