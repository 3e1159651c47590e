//! Lynk manifest (`meta.info`): tracker address, owner and whole-file entries
//!
//! The format is line oriented, one `key:::value` pair per line. A header of
//! `announce`, `lynkName`, `owner` (and optionally `trackerKey` and
//! `generation`) is followed by
//! one block per file, each closed by the `:#!` sentinel:
//!
//! ```text
//! announce:::10.0.0.1:9000
//! lynkName:::Docs
//! owner:::alice
//! length:::100
//! path:::/home/alice/Lynx/Docs/a.txt
//! name:::a.txt
//! chunkLength:::-1
//! chunks:::chunking not currently implemented
//! :#!
//! ```
//!
//! Paths are written absolute but re-anchored to `<home>/<lynkName>` when a
//! manifest is parsed, so a manifest produced on one machine is usable on
//! another.

use crate::error::{LynxError, Result};
use crate::protocol::{CHUNK_PLACEHOLDER, END_OF_ENTRY, RECORD_SEPARATOR};
use crate::protocol_core::write_atomic;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// One file inside a lynk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Unique within the lynk: `/`-separated path relative to the lynk root
    pub name: String,
    pub relative_path: String,
    pub length: u64,
    /// Reserved for chunked transfer, `-1` = unchunked
    pub chunk_length: i64,
    /// Reserved for chunk hashes
    pub chunk_digest: String,
}

/// Name and size of a file on disk, relative to its lynk root
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileStat {
    pub name: String,
    pub length: u64,
}

impl FileStat {
    /// Stat `path`, naming it relative to `root`
    pub fn from_path(root: &Path, path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(LynxError::NotFound(format!("{} is not a file", path.display())));
        }
        let rel = path.strip_prefix(root).map_err(|_| {
            LynxError::NotFound(format!("{} is outside {}", path.display(), root.display()))
        })?;
        Ok(Self {
            name: rel_to_name(rel),
            length: meta.len(),
        })
    }
}

/// `/`-joined name for a relative path
pub fn rel_to_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

impl FileEntry {
    pub fn from_stat(stat: &FileStat) -> Self {
        Self {
            name: stat.name.clone(),
            relative_path: stat.name.clone(),
            length: stat.length,
            chunk_length: -1,
            chunk_digest: CHUNK_PLACEHOLDER.to_string(),
        }
    }
}

/// In-memory `meta.info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub lynk_name: String,
    /// Tracker `host:port`
    pub tracker: String,
    pub owner: String,
    /// Hex public key of the tracker, used to seal pushes
    pub tracker_key: Option<String>,
    /// Bumped by the tracker on every accepted change; 0 when never stamped
    pub generation: u64,
    /// Directory the relative paths are anchored to
    pub root: PathBuf,
    files: Vec<FileEntry>,
}

impl Manifest {
    pub fn new(
        lynk_name: impl Into<String>,
        owner: impl Into<String>,
        tracker: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            lynk_name: lynk_name.into(),
            tracker: tracker.into(),
            owner: owner.into(),
            tracker_key: None,
            generation: 0,
            root: root.into(),
            files: Vec::new(),
        }
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.file(name).is_some()
    }

    /// Absolute location of an entry under this manifest's root
    pub fn path_of(&self, entry: &FileEntry) -> PathBuf {
        let mut p = self.root.clone();
        for part in entry.relative_path.split('/').filter(|s| !s.is_empty()) {
            p.push(part);
        }
        p
    }

    /// Add a file; a name already present is rejected
    pub fn add_file(&mut self, stat: &FileStat) -> Result<()> {
        if self.contains(&stat.name) {
            return Err(LynxError::Duplicate(format!(
                "{} already in lynk {}",
                stat.name, self.lynk_name
            )));
        }
        self.files.push(FileEntry::from_stat(stat));
        Ok(())
    }

    /// Remove a file by name; absent names are a no-op. Returns true if removed.
    pub fn remove_file(&mut self, name: &str) -> bool {
        let before = self.files.len();
        self.files.retain(|f| f.name != name);
        before != self.files.len()
    }

    /// True when the listing does not match the manifest by `(name, length)`
    pub fn differs_from(&self, listing: &[FileStat]) -> bool {
        let ours: BTreeSet<(&str, u64)> =
            self.files.iter().map(|f| (f.name.as_str(), f.length)).collect();
        let theirs: BTreeSet<(&str, u64)> =
            listing.iter().map(|s| (s.name.as_str(), s.length)).collect();
        ours != theirs
    }

    /// Same header, file list replaced by `listing` (sorted by name)
    pub fn rebuilt(&self, listing: &[FileStat]) -> Manifest {
        let mut sorted = listing.to_vec();
        sorted.sort();
        sorted.dedup_by(|a, b| a.name == b.name);
        Manifest {
            files: sorted.iter().map(FileEntry::from_stat).collect(),
            ..self.clone()
        }
    }

    /// Rendering without the generation stamp, for comparing file lists
    /// and headers across tracker rounds
    pub fn content(&self) -> String {
        Manifest {
            generation: 0,
            ..self.clone()
        }
        .render()
    }

    /// Copy of this manifest anchored to another root
    pub fn anchored_to(&self, root: impl Into<PathBuf>) -> Manifest {
        Manifest {
            root: root.into(),
            ..self.clone()
        }
    }

    /// Parse `meta.info` text, anchoring paths to `<home>/<lynkName>`
    pub fn parse(text: &str, home: &Path) -> Result<Self> {
        let mut lynk_name = None;
        let mut tracker = None;
        let mut owner = String::new();
        let mut tracker_key = None;
        let mut generation = 0;
        let mut raw_files: Vec<(FileEntry, Option<String>)> = Vec::new();
        let mut pending = PendingEntry::default();

        // `lines` drops the `\n`/`\r\n`; values are kept verbatim since file
        // names may start or end with spaces
        for (n, line) in text.lines().enumerate() {
            if line.trim_end() == END_OF_ENTRY {
                if !pending.is_empty() {
                    raw_files.push(pending.finish(n + 1)?);
                }
                pending = PendingEntry::default();
                continue;
            }
            let Some((key, value)) = line.split_once(RECORD_SEPARATOR) else {
                continue;
            };
            match key.trim() {
                "announce" => tracker = Some(value.to_string()),
                "lynkName" => lynk_name = Some(value.to_string()),
                "owner" => owner = value.to_string(),
                "trackerKey" if !value.is_empty() => tracker_key = Some(value.to_string()),
                "generation" => generation = parse_num(value, "generation", n + 1)?,
                "length" => pending.length = Some(parse_num(value, "length", n + 1)?),
                "path" => pending.path = Some(value.to_string()),
                "name" => pending.name = Some(value.to_string()),
                "chunkLength" | "pieces_length" => {
                    pending.chunk_length = Some(parse_num(value, "chunkLength", n + 1)?)
                }
                "chunks" | "pieces" => pending.chunk_digest = Some(value.to_string()),
                _ => {} // forward compatibility
            }
        }
        if !pending.is_empty() {
            return Err(LynxError::Format("unterminated file record".into()));
        }

        let lynk_name =
            lynk_name.ok_or_else(|| LynxError::Format("missing lynkName record".into()))?;
        if !crate::protocol_core::is_valid_lynk_name(&lynk_name) {
            return Err(LynxError::Format(format!("invalid lynk name {lynk_name:?}")));
        }
        let tracker = tracker.ok_or_else(|| LynxError::Format("missing announce record".into()))?;

        let mut manifest = Manifest {
            root: home.join(&lynk_name),
            lynk_name,
            tracker,
            owner,
            tracker_key,
            generation,
            files: Vec::new(),
        };
        for (mut entry, stored_path) in raw_files {
            entry.relative_path = match stored_path {
                Some(p) => anchor_relative(&p, &manifest.lynk_name, &entry.name),
                None => entry.name.clone(),
            };
            if manifest.contains(&entry.name) {
                return Err(LynxError::Format(format!("duplicate file {}", entry.name)));
            }
            manifest.files.push(entry);
        }
        Ok(manifest)
    }

    /// Serialize to `meta.info` text
    pub fn render(&self) -> String {
        let sep = RECORD_SEPARATOR;
        let mut out = String::new();
        out.push_str(&format!("announce{sep}{}\n", self.tracker));
        out.push_str(&format!("lynkName{sep}{}\n", self.lynk_name));
        out.push_str(&format!("owner{sep}{}\n", self.owner));
        if let Some(key) = &self.tracker_key {
            out.push_str(&format!("trackerKey{sep}{key}\n"));
        }
        if self.generation > 0 {
            out.push_str(&format!("generation{sep}{}\n", self.generation));
        }
        for f in &self.files {
            out.push_str(&format!("length{sep}{}\n", f.length));
            out.push_str(&format!("path{sep}{}\n", self.path_of(f).to_string_lossy()));
            out.push_str(&format!("name{sep}{}\n", f.name));
            out.push_str(&format!("chunkLength{sep}{}\n", f.chunk_length));
            out.push_str(&format!("chunks{sep}{}\n", f.chunk_digest));
            out.push_str(END_OF_ENTRY);
            out.push('\n');
        }
        out
    }

    pub fn load(path: &Path, home: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text, home),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LynxError::NotFound(format!("manifest {}", path.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.render().as_bytes())
    }
}

#[derive(Default)]
struct PendingEntry {
    length: Option<u64>,
    path: Option<String>,
    name: Option<String>,
    chunk_length: Option<i64>,
    chunk_digest: Option<String>,
}

impl PendingEntry {
    fn is_empty(&self) -> bool {
        self.length.is_none()
            && self.path.is_none()
            && self.name.is_none()
            && self.chunk_length.is_none()
            && self.chunk_digest.is_none()
    }

    fn finish(self, line: usize) -> Result<(FileEntry, Option<String>)> {
        let name = self
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| LynxError::Format(format!("file record ending at line {line} has no name")))?;
        let length = self
            .length
            .ok_or_else(|| LynxError::Format(format!("file {name} has no length")))?;
        Ok((
            FileEntry {
                relative_path: name.clone(),
                name,
                length,
                chunk_length: self.chunk_length.unwrap_or(-1),
                chunk_digest: self
                    .chunk_digest
                    .unwrap_or_else(|| CHUNK_PLACEHOLDER.to_string()),
            },
            self.path,
        ))
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, key: &str, line: usize) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| LynxError::Format(format!("line {line}: bad {key} {value:?}: {e}")))
}

/// Recover the path relative to the lynk root from a path written on another
/// machine: the tail after a component equal to the lynk name. A tail equal to
/// `name` wins; otherwise the first occurrence; otherwise `name` itself.
fn anchor_relative(stored: &str, lynk: &str, name: &str) -> String {
    let comps: Vec<&str> = stored.split(['/', '\\']).filter(|c| !c.is_empty()).collect();
    let tails: Vec<String> = comps
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == lynk)
        .map(|(i, _)| comps[i + 1..].join("/"))
        .filter(|t| !t.is_empty() && !t.split('/').any(|c| c == ".." || c == "."))
        .collect();
    if tails.iter().any(|t| t == name) {
        return name.to_string();
    }
    tails.into_iter().next().unwrap_or_else(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(name: &str, length: u64) -> FileStat {
        FileStat {
            name: name.into(),
            length,
        }
    }

    fn sample(home: &Path, files: &[(&str, u64)]) -> Manifest {
        let mut m = Manifest::new("Docs", "alice", "10.0.0.1:9000", home.join("Docs"));
        for (name, len) in files {
            m.add_file(&stat(name, *len)).unwrap();
        }
        m
    }

    #[test]
    fn round_trip_zero_one_many_files() {
        let home = Path::new("/home/alice/Lynx");
        for files in [
            vec![],
            vec![("a.txt", 100)],
            vec![("a.txt", 100), ("b.txt", 0), ("sub/c.bin", 4096)],
        ] {
            let m = sample(home, &files);
            let parsed = Manifest::parse(&m.render(), home).unwrap();
            assert_eq!(parsed, m);
            assert_eq!(parsed.render(), m.render());
        }
    }

    #[test]
    fn names_with_spaces_and_colons_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let m = sample(
            dir.path(),
            &[("notes.txt ", 3), (" leading.txt", 4), ("a:b.txt", 5), ("sub/x :y", 6)],
        );
        let path = dir.path().join("Docs").join("meta.info");
        m.save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();

        let loaded = Manifest::load(&path, dir.path()).unwrap();
        assert_eq!(loaded, m);
        assert!(loaded.contains("notes.txt "));
        assert!(!loaded.contains("notes.txt"));
        assert_eq!(loaded.file("sub/x :y").unwrap().relative_path, "sub/x :y");
        loaded.save(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
    }

    #[test]
    fn tracker_key_and_generation_survive_round_trip() {
        let home = Path::new("/h");
        let mut m = sample(home, &[("a.txt", 1)]);
        m.tracker_key = Some("ab".repeat(32));
        m.generation = 7;
        let parsed = Manifest::parse(&m.render(), home).unwrap();
        assert_eq!(parsed.tracker_key, m.tracker_key);
        assert_eq!(parsed.generation, 7);

        let mut older = parsed.clone();
        older.generation = 6;
        assert_ne!(older.render(), parsed.render());
        assert_eq!(older.content(), parsed.content());
        assert!(!sample(home, &[]).render().contains("generation"));
    }

    #[test]
    fn paths_are_reanchored_to_local_home() {
        let m = sample(Path::new("/home/alice/Lynx"), &[("a.txt", 1), ("sub/c.bin", 2)]);
        let text = m.render();
        assert!(text.contains("path:::/home/alice/Lynx/Docs/a.txt"));

        let bob = Manifest::parse(&text, Path::new("/home/bob/Lynx")).unwrap();
        assert_eq!(bob.root, Path::new("/home/bob/Lynx/Docs"));
        let c = bob.file("sub/c.bin").unwrap();
        assert_eq!(c.relative_path, "sub/c.bin");
        assert_eq!(bob.path_of(c), Path::new("/home/bob/Lynx/Docs/sub/c.bin"));
    }

    #[test]
    fn legacy_records_and_unknown_keys() {
        let text = "\
announce:::127.0.0.1:9000
lynkName:::Docs
owner:::max
colour:::blue
length:::12
path:::/Users/max/Lynx/Docs/photos/test.txt
name:::test.txt
pieces_length:::-1
pieces:::chuncking not currently implemented
:#!
";
        let m = Manifest::parse(text, Path::new("/srv")).unwrap();
        assert_eq!(m.tracker, "127.0.0.1:9000");
        let f = m.file("test.txt").unwrap();
        assert_eq!(f.length, 12);
        assert_eq!(f.chunk_length, -1);
        assert_eq!(f.relative_path, "photos/test.txt");
    }

    #[test]
    fn format_errors() {
        let home = Path::new("/h");
        assert!(matches!(
            Manifest::parse("announce:::x:1\n", home),
            Err(LynxError::Format(_))
        ));
        assert!(matches!(
            Manifest::parse("lynkName:::Docs\n", home),
            Err(LynxError::Format(_))
        ));
        let bad_len = "announce:::x:1\nlynkName:::Docs\nlength:::ten\nname:::a\n:#!\n";
        assert!(matches!(Manifest::parse(bad_len, home), Err(LynxError::Format(_))));
        let unterminated = "announce:::x:1\nlynkName:::Docs\nlength:::1\nname:::a\n";
        assert!(matches!(
            Manifest::parse(unterminated, home),
            Err(LynxError::Format(_))
        ));
    }

    #[test]
    fn add_file_rejects_duplicates_only() {
        let mut m = sample(Path::new("/h"), &[("a.txt", 1)]);
        assert!(matches!(
            m.add_file(&stat("a.txt", 5)),
            Err(LynxError::Duplicate(_))
        ));
        m.add_file(&stat("b.txt", 5)).unwrap();
        m.add_file(&stat("sub/a.txt", 5)).unwrap();
        assert_eq!(m.files().len(), 3);
    }

    #[test]
    fn remove_file_is_noop_when_absent() {
        let mut m = sample(Path::new("/h"), &[("a.txt", 1), ("b.txt", 2)]);
        assert!(!m.remove_file("zzz"));
        assert!(m.remove_file("a.txt"));
        assert_eq!(m.files().len(), 1);
        assert!(!m.contains("a.txt"));
    }

    #[test]
    fn drift_detection_by_name_and_length() {
        let m = sample(Path::new("/h"), &[("a.txt", 1), ("b.txt", 2)]);
        assert!(!m.differs_from(&[stat("b.txt", 2), stat("a.txt", 1)]));
        assert!(m.differs_from(&[stat("a.txt", 1)]));
        assert!(m.differs_from(&[stat("a.txt", 1), stat("b.txt", 3)]));
        assert!(m.differs_from(&[stat("a.txt", 1), stat("b.txt", 2), stat("c", 0)]));
    }

    #[test]
    fn rebuild_is_deterministic() {
        let m = sample(Path::new("/h"), &[]);
        let a = m.rebuilt(&[stat("b", 2), stat("a", 1)]);
        let b = m.rebuilt(&[stat("a", 1), stat("b", 2)]);
        assert_eq!(a.render(), b.render());
        assert_eq!(a.files()[0].name, "a");
    }

    #[test]
    fn save_and_load_files() {
        let dir = tempfile::tempdir().unwrap();
        let m = sample(dir.path(), &[("a.txt", 100)]);
        let path = dir.path().join("Docs").join("meta.info");
        m.save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let loaded = Manifest::load(&path, dir.path()).unwrap();
        assert_eq!(loaded, m);
        loaded.save(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);

        assert!(matches!(
            Manifest::load(&dir.path().join("missing.info"), dir.path()),
            Err(LynxError::NotFound(_))
        ));
    }

    #[test]
    fn file_stat_names_are_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/c.bin"), [0u8; 7]).unwrap();
        let s = FileStat::from_path(dir.path(), &dir.path().join("sub/c.bin")).unwrap();
        assert_eq!(s, stat("sub/c.bin", 7));
        assert!(FileStat::from_path(dir.path(), &dir.path().join("sub")).is_err());
    }
}
