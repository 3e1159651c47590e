//! Request-line codec and path helpers shared by the tracker and peer services
//!
//! Every connection starts with one newline-terminated ASCII line whose fields
//! are separated by `:`. This module turns those lines into [`Request`] values
//! and back, so both listener roles and the client side agree on the syntax.

use crate::crypto::is_valid_public_key;
use crate::error::{LynxError, Result};
use crate::protocol::verb;
use crate::swarm::PeerRef;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// One parsed request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `Swarm_Request:<ip>:<port>:<lynk>[:<key>]`
    SwarmRequest { peer: PeerRef, lynk: String },
    /// `Meta_Request:<ip>:<port>:<lynk>[:<key>]`
    MetaRequest { peer: PeerRef, lynk: String },
    /// `Meta_Push:<lynk>`, sealed body follows until EOF
    MetaPush { lynk: String },
    /// `Disconnect:<ip>:<lynk>` or `Disconnect:<ip>:<port>:<lynk>`
    Disconnect {
        ip: String,
        port: Option<u16>,
        lynk: String,
    },
    /// `Do_You_Have_FileName:<lynk>/<file>[:<key>]`
    HaveFile {
        lynk: String,
        file: String,
        key: Option<String>,
    },
    /// `Tracker_Request:<lynk>/`
    TrackerRequest { lynk: String },
}

impl Request {
    /// Parse one request line (trailing `\r\n` tolerated)
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let syntax = |why: &str| LynxError::ProtocolSyntax(format!("{why}: {line:?}"));

        // file names may contain ':', so only the verb and a trailing key are split off
        if let Some(rest) = line
            .strip_prefix(verb::HAVE_FILE)
            .and_then(|r| r.strip_prefix(':'))
        {
            let (target, key) = match rest.rsplit_once(':') {
                Some((target, key)) if is_valid_public_key(key) => (target, Some(key.to_string())),
                _ => (rest, None),
            };
            let (lynk, file) = target
                .split_once('/')
                .ok_or_else(|| syntax("expected <lynk>/<file>"))?;
            let lynk = lynk_field(lynk).ok_or_else(|| syntax("bad lynk name"))?;
            let file = non_empty(file).ok_or_else(|| syntax("empty file name"))?;
            return Ok(Request::HaveFile { lynk, file, key });
        }

        let fields: Vec<&str> = line.split(':').collect();
        match fields[0] {
            verb::SWARM_REQUEST | verb::META_REQUEST => {
                if fields.len() != 4 && fields.len() != 5 {
                    return Err(syntax("expected <ip>:<port>:<lynk>[:<key>]"));
                }
                let public_key = fields.get(4).copied().unwrap_or_default();
                if !public_key.is_empty() && !is_valid_public_key(public_key) {
                    return Err(syntax("bad public key"));
                }
                let peer = PeerRef {
                    ip: non_empty(fields[1]).ok_or_else(|| syntax("empty ip"))?,
                    port: parse_port(fields[2]).ok_or_else(|| syntax("bad port"))?,
                    public_key: public_key.to_string(),
                };
                let lynk = lynk_field(fields[3]).ok_or_else(|| syntax("bad lynk name"))?;
                if fields[0] == verb::SWARM_REQUEST {
                    Ok(Request::SwarmRequest { peer, lynk })
                } else {
                    Ok(Request::MetaRequest { peer, lynk })
                }
            }
            verb::META_PUSH => {
                if fields.len() != 2 {
                    return Err(syntax("expected <lynk>"));
                }
                let lynk = lynk_field(fields[1]).ok_or_else(|| syntax("bad lynk name"))?;
                Ok(Request::MetaPush { lynk })
            }
            verb::DISCONNECT => {
                let (ip, port, lynk) = match fields.len() {
                    3 => (fields[1], None, fields[2]),
                    4 => (
                        fields[1],
                        Some(parse_port(fields[2]).ok_or_else(|| syntax("bad port"))?),
                        fields[3],
                    ),
                    _ => return Err(syntax("expected <ip>[:<port>]:<lynk>")),
                };
                Ok(Request::Disconnect {
                    ip: non_empty(ip).ok_or_else(|| syntax("empty ip"))?,
                    port,
                    lynk: lynk_field(lynk).ok_or_else(|| syntax("bad lynk name"))?,
                })
            }
            verb::TRACKER_REQUEST => {
                if fields.len() != 2 {
                    return Err(syntax("expected <lynk>/"));
                }
                let lynk = lynk_field(fields[1].trim_end_matches('/'))
                    .ok_or_else(|| syntax("bad lynk name"))?;
                Ok(Request::TrackerRequest { lynk })
            }
            _ => Err(syntax("unknown request")),
        }
    }

    /// Render as a newline-terminated request line
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }

    /// Lynk the request is about
    pub fn lynk(&self) -> &str {
        match self {
            Request::SwarmRequest { lynk, .. }
            | Request::MetaRequest { lynk, .. }
            | Request::MetaPush { lynk }
            | Request::Disconnect { lynk, .. }
            | Request::HaveFile { lynk, .. }
            | Request::TrackerRequest { lynk } => lynk,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn peer_line(f: &mut fmt::Formatter<'_>, v: &str, p: &PeerRef, lynk: &str) -> fmt::Result {
            write!(f, "{}:{}:{}:{}", v, p.ip, p.port, lynk)?;
            if !p.public_key.is_empty() {
                write!(f, ":{}", p.public_key)?;
            }
            Ok(())
        }
        match self {
            Request::SwarmRequest { peer, lynk } => peer_line(f, verb::SWARM_REQUEST, peer, lynk),
            Request::MetaRequest { peer, lynk } => peer_line(f, verb::META_REQUEST, peer, lynk),
            Request::MetaPush { lynk } => write!(f, "{}:{}", verb::META_PUSH, lynk),
            Request::Disconnect { ip, port, lynk } => match port {
                Some(port) => write!(f, "{}:{}:{}:{}", verb::DISCONNECT, ip, port, lynk),
                None => write!(f, "{}:{}:{}", verb::DISCONNECT, ip, lynk),
            },
            Request::HaveFile { lynk, file, key } => {
                write!(f, "{}:{}/{}", verb::HAVE_FILE, lynk, file)?;
                if let Some(key) = key {
                    write!(f, ":{key}")?;
                }
                Ok(())
            }
            Request::TrackerRequest { lynk } => write!(f, "{}:{}/", verb::TRACKER_REQUEST, lynk),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

fn lynk_field(s: &str) -> Option<String> {
    if is_valid_lynk_name(s) {
        Some(s.to_string())
    } else {
        None
    }
}

/// Lynk names become directory names and request fields
pub fn is_valid_lynk_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', ':', '\0', '\n', '\r'])
}

/// Normalize a path to be safely under a root directory.
/// Rejects absolute paths, parent components and NUL bytes, then makes sure
/// the canonical result (symlinks resolved) stays under the canonical root.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        return Err(LynxError::ProtocolSyntax("path contains NUL byte".into()));
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                return Err(LynxError::ProtocolSyntax(format!(
                    "path contains disallowed component: {component:?}"
                )));
            }
        }
    }

    let canon_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let joined = canon_root.join(&safe);

    // Existing paths resolve symlinks; new files canonicalize their parent
    let final_path = if joined.exists() {
        joined.canonicalize()?
    } else if let (Some(parent), Some(name)) = (joined.parent(), joined.file_name()) {
        if parent.exists() {
            parent.canonicalize()?.join(name)
        } else {
            joined.clone()
        }
    } else {
        joined.clone()
    };

    if !final_path.starts_with(&canon_root) {
        return Err(LynxError::ProtocolSyntax(format!(
            "path {p:?} escapes root {root:?}"
        )));
    }
    Ok(final_path)
}

/// Replace `path` with `bytes` through a temp file in the same directory
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write as _;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    ensure_dir_exists(&dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(crate::protocol::TEMP_PREFIX)
        .tempfile_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| LynxError::Io(e.error))?;
    Ok(())
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    Ok(())
}
