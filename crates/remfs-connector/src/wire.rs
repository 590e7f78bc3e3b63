//! Connector wire format
//!
//! Deserialization types for connector JSON responses and the conversion
//! into the port-level [`NormalizedResponse`]. Connectors in the wild are
//! loose about types, so this module accepts:
//!
//! - booleans as `true`/`false`, `0`/`1` or `"0"`/`"1"`
//! - sizes as numbers, numeric strings or `"unknown"`
//! - upload limits as byte counts or shorthand such as `"32M"`
//! - `error`/`warning` as a string or a (nested) array of strings
//!
//! It also encodes command arguments into request parameters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use remfs_core::domain::{
    Command, CompareToken, Entry, EntryId, MergeToken, Permissions, VolumeOptions,
};
use remfs_core::ports::{NormalizedResponse, TransportError};

/// MIME type connectors use for directories
pub const DIRECTORY_MIME: &str = "directory";

// ============================================================================
// Lenient scalar helpers
// ============================================================================

fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false")),
        _ => false,
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?.is_some_and(|v| value_as_bool(&v)))
}

fn flag_or_true<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?.map_or(true, |v| value_as_bool(&v)))
}

fn default_true() -> bool {
    true
}

fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(|v| value_as_u64(&v)))
}

fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Parse an upload limit such as `134217728`, `"128M"` or `"2G"`
pub fn parse_byte_size(value: &Value) -> Option<u64> {
    if let Some(n) = value_as_u64(value) {
        return Some(n);
    }
    let s = value.as_str()?.trim();
    let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit())?);
    let base: u64 = digits.parse().ok()?;
    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        _ => return None,
    };
    base.checked_mul(multiplier)
}

/// Flatten a message field (string or nested array) into strings
fn messages(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(messages).collect(),
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Volume options as sent by the connector
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOptions {
    #[serde(default, deserialize_with = "text")]
    pub path: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub tmb_url: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub separator: Option<String>,
    #[serde(default)]
    pub disabled: Vec<String>,
    #[serde(default, deserialize_with = "flag")]
    pub copy_overwrite: bool,
    #[serde(default, deserialize_with = "flag")]
    pub upload_overwrite: bool,
    #[serde(default)]
    pub upload_max_size: Option<Value>,
}

impl From<WireOptions> for VolumeOptions {
    fn from(options: WireOptions) -> Self {
        VolumeOptions {
            path: options.path,
            url: options.url,
            tmb_url: options.tmb_url,
            separator: options.separator,
            disabled: options.disabled,
            copy_overwrite: options.copy_overwrite,
            upload_overwrite: options.upload_overwrite,
            upload_max_size: options.upload_max_size.as_ref().and_then(parse_byte_size),
        }
    }
}

/// One file or directory record
#[derive(Debug, Clone, Deserialize)]
pub struct WireEntry {
    pub hash: String,
    #[serde(default, deserialize_with = "text")]
    pub phash: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "text")]
    pub mime: Option<String>,
    #[serde(default, deserialize_with = "number")]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "number")]
    pub ts: Option<u64>,
    #[serde(default = "default_true", deserialize_with = "flag_or_true")]
    pub read: bool,
    #[serde(default = "default_true", deserialize_with = "flag_or_true")]
    pub write: bool,
    #[serde(default, deserialize_with = "flag")]
    pub locked: bool,
    /// Thumbnail file name, or `1` while generation is pending
    #[serde(default)]
    pub tmb: Option<Value>,
    #[serde(default, deserialize_with = "flag")]
    pub dirs: bool,
    #[serde(default, deserialize_with = "text")]
    pub volumeid: Option<String>,
    #[serde(default)]
    pub options: Option<WireOptions>,
}

impl WireEntry {
    /// Convert into a domain [`Entry`]
    ///
    /// `fallback_options` is attached when this record is a volume root that
    /// carries no options of its own.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidResponse`] for unusable ids
    pub fn into_entry(self, fallback_options: Option<&WireOptions>) -> Result<Entry, TransportError> {
        let id = parse_id(&self.hash)?;
        let parent_id = self.phash.as_deref().map(parse_id).transpose()?;
        let is_directory = self.mime.as_deref() == Some(DIRECTORY_MIME);

        let volume_options = if parent_id.is_none() || self.options.is_some() {
            Some(
                self.options
                    .or_else(|| fallback_options.cloned())
                    .unwrap_or_default()
                    .into(),
            )
        } else {
            None
        };

        let thumbnail = match self.tmb {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        };

        Ok(Entry {
            id,
            parent_id,
            name: self.name,
            is_directory,
            size: if is_directory { None } else { self.size },
            modified: self
                .ts
                .and_then(|ts| i64::try_from(ts).ok())
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            permissions: Permissions {
                read: self.read,
                write: self.write,
            },
            locked: self.locked,
            mime: if is_directory { None } else { self.mime },
            thumbnail,
            has_subdirs: self.dirs,
            volume_id: self.volumeid,
            volume_options,
            aggregate_size: None,
        })
    }
}

fn parse_id(raw: &str) -> Result<EntryId, TransportError> {
    EntryId::new(raw).map_err(|e| TransportError::InvalidResponse(e.to_string()))
}

/// Complete connector response body
#[derive(Debug, Default, Deserialize)]
pub struct WireResponse {
    #[serde(default)]
    pub cwd: Option<WireEntry>,
    #[serde(default)]
    pub options: Option<WireOptions>,
    #[serde(default)]
    pub files: Vec<WireEntry>,
    /// `tree` and `parents` report their entries here
    #[serde(default)]
    pub tree: Vec<WireEntry>,
    #[serde(default)]
    pub added: Vec<WireEntry>,
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default)]
    pub changed: Vec<WireEntry>,
    /// `ls`: either `{hash: name}` or `[name, ...]`
    #[serde(default)]
    pub list: Option<Value>,
    /// `tmb`: `{hash: thumbnail}`
    #[serde(default)]
    pub images: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "number")]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "text")]
    pub compare: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub unchanged: bool,
    #[serde(default, rename = "_chunkmerged", deserialize_with = "text")]
    pub chunk_merged: Option<String>,
    #[serde(default, rename = "_name", deserialize_with = "text")]
    pub merged_name: Option<String>,
    #[serde(default, rename = "uplMaxSize")]
    pub upl_max_size: Option<Value>,
    #[serde(default, deserialize_with = "text")]
    pub api: Option<String>,
    #[serde(default)]
    pub warning: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Parse a response body
///
/// # Errors
/// Returns [`TransportError::InvalidResponse`] when the body is not a
/// connector JSON object
pub fn parse_response(body: &[u8]) -> Result<WireResponse, TransportError> {
    serde_json::from_slice(body).map_err(|e| TransportError::InvalidResponse(e.to_string()))
}

impl WireResponse {
    /// Reduce to the port-level response
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidResponse`] for unusable ids or tokens
    pub fn normalize(self) -> Result<NormalizedResponse, TransportError> {
        let options = self.options;
        let convert = |entries: Vec<WireEntry>| -> Result<Vec<Entry>, TransportError> {
            entries
                .into_iter()
                .map(|e| e.into_entry(options.as_ref()))
                .collect()
        };

        let cwd = self
            .cwd
            .map(|e| e.into_entry(options.as_ref()))
            .transpose()?;

        let mut files = convert(self.files)?;
        for entry in convert(self.tree)? {
            if !files.iter().any(|f| f.id == entry.id) {
                files.push(entry);
            }
        }

        let removed = self
            .removed
            .iter()
            .map(|raw| parse_id(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let mut listing = BTreeMap::new();
        match self.list {
            Some(Value::Object(map)) => {
                for (hash, name) in map {
                    let Some(name) = name.as_str() else { continue };
                    listing.insert(name.to_string(), EntryId::new(hash).ok());
                }
            }
            Some(Value::Array(names)) => {
                for name in names.iter().filter_map(Value::as_str) {
                    listing.insert(name.to_string(), None);
                }
            }
            _ => {}
        }

        let thumbnails = self
            .images
            .into_iter()
            .filter_map(|(hash, tmb)| EntryId::new(hash).ok().map(|id| (id, tmb)))
            .collect();

        let compare_token = self
            .compare
            .as_deref()
            .map(str::parse::<CompareToken>)
            .transpose()
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        let merge_token = self
            .chunk_merged
            .map(MergeToken::new)
            .transpose()
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        let error = self.error.as_ref().map(messages).filter(|e| !e.is_empty());

        Ok(NormalizedResponse {
            cwd,
            added: convert(self.added)?,
            changed: convert(self.changed)?,
            files,
            removed,
            listing,
            thumbnails,
            compare_token,
            unchanged: self.unchanged,
            size: self.size,
            merge_token,
            merged_name: self.merged_name,
            upload_max_size: self.upl_max_size.as_ref().and_then(parse_byte_size),
            api: self.api,
            warnings: self.warning.as_ref().map(messages).unwrap_or_default(),
            error,
        })
    }
}

// ============================================================================
// Request parameters
// ============================================================================

fn push_targets(params: &mut Vec<(String, String)>, key: &str, targets: &[EntryId]) {
    params.extend(targets.iter().map(|t| (key.to_string(), t.to_string())));
}

fn push_flag(params: &mut Vec<(String, String)>, key: &str, value: bool) {
    if value {
        params.push((key.to_string(), "1".to_string()));
    }
}

/// Encode a non-upload command as request parameters
///
/// Upload payloads are multipart bodies (see [`crate::upload`]); for them
/// only the `cmd` and `target` parameters are returned.
pub fn encode_params(command: &Command) -> Vec<(String, String)> {
    let mut params = vec![("cmd".to_string(), command.kind().as_str().to_string())];
    let p = &mut params;

    match command {
        Command::Open {
            target,
            init,
            tree,
            compare,
        } => {
            p.push((
                "target".into(),
                target.as_ref().map(ToString::to_string).unwrap_or_default(),
            ));
            push_flag(p, "init", *init);
            push_flag(p, "tree", *tree);
            if let Some(token) = compare {
                p.push(("compare".into(), token.to_wire()));
            }
        }
        Command::Ls { target, intersect } => {
            p.push(("target".into(), target.to_string()));
            p.extend(intersect.iter().map(|n| ("intersect[]".to_string(), n.clone())));
        }
        Command::Tree { target } | Command::Parents { target } => {
            p.push(("target".into(), target.to_string()));
        }
        Command::Tmb { targets }
        | Command::Size { targets }
        | Command::Duplicate { targets }
        | Command::Rm { targets }
        | Command::Info { targets } => push_targets(p, "targets[]", targets),
        Command::Mkdir { target, name }
        | Command::Mkfile { target, name }
        | Command::Rename { target, name } => {
            p.push(("target".into(), target.to_string()));
            p.push(("name".into(), name.clone()));
        }
        Command::Paste {
            dst,
            targets,
            cut,
            renames,
            suffix,
        } => {
            p.push(("dst".into(), dst.to_string()));
            push_targets(p, "targets[]", targets);
            push_flag(p, "cut", *cut);
            p.extend(renames.iter().map(|n| ("renames[]".to_string(), n.clone())));
            if let Some(suffix) = suffix {
                p.push(("suffix".into(), suffix.clone()));
            }
        }
        Command::Search { query, target } => {
            p.push(("q".into(), query.clone()));
            if let Some(target) = target {
                p.push(("target".into(), target.to_string()));
            }
        }
        Command::Upload(payload) => {
            p.push(("target".into(), payload.target().to_string()));
        }
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> EntryId {
        EntryId::new(s).unwrap()
    }

    #[test]
    fn test_lenient_entry_fields() {
        let raw = json!({
            "hash": "l1_YQ",
            "phash": "l1_Lw",
            "name": "a.txt",
            "mime": "text/plain",
            "size": "unknown",
            "ts": 1700000000,
            "read": 1,
            "write": "0",
            "locked": true,
            "tmb": 1
        });
        let wire: WireEntry = serde_json::from_value(raw).unwrap();
        let entry = wire.into_entry(None).unwrap();

        assert_eq!(entry.parent_id, Some(id("l1_Lw")));
        assert!(!entry.is_directory);
        assert_eq!(entry.size, None);
        assert_eq!(entry.modified.unwrap().timestamp(), 1_700_000_000);
        assert!(entry.permissions.read);
        assert!(!entry.permissions.write);
        assert!(entry.locked);
        // pending thumbnail is not a reference yet
        assert_eq!(entry.thumbnail, None);
        assert!(!entry.is_root());
    }

    #[test]
    fn test_root_gets_fallback_options() {
        let wire: WireEntry = serde_json::from_value(json!({
            "hash": "l1_Lw",
            "phash": "",
            "name": "Home",
            "mime": "directory",
            "dirs": 1,
            "volumeid": "l1_"
        }))
        .unwrap();
        let options = WireOptions {
            disabled: vec!["mkfile".into()],
            upload_max_size: Some(json!("2M")),
            ..WireOptions::default()
        };

        let entry = wire.into_entry(Some(&options)).unwrap();
        assert!(entry.is_root());
        assert!(entry.has_subdirs);
        assert_eq!(entry.volume_id.as_deref(), Some("l1_"));
        let opts = entry.volume_options.unwrap();
        assert_eq!(opts.disabled, vec!["mkfile".to_string()]);
        assert_eq!(opts.upload_max_size, Some(2 * 1024 * 1024));
    }

    #[test]
    fn test_volume_options_drop_empty_urls() {
        let wire: WireOptions = serde_json::from_value(json!({
            "path": "Home",
            "url": "",
            "tmbUrl": "https://files.example/.tmb/",
            "separator": "/",
            "copyOverwrite": 1
        }))
        .unwrap();

        let opts = VolumeOptions::from(wire);
        assert_eq!(opts.path.as_deref(), Some("Home"));
        assert_eq!(opts.url, None);
        assert_eq!(opts.tmb_url.as_deref(), Some("https://files.example/.tmb/"));
        assert!(opts.copy_overwrite);
        assert!(!opts.upload_overwrite);
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size(&json!(1024)), Some(1024));
        assert_eq!(parse_byte_size(&json!("512")), Some(512));
        assert_eq!(parse_byte_size(&json!("32M")), Some(32 << 20));
        assert_eq!(parse_byte_size(&json!("1 G")), Some(1 << 30));
        assert_eq!(parse_byte_size(&json!("lots")), None);
    }

    #[test]
    fn test_normalize_error_messages_flattened() {
        let wire = parse_response(br##"{"error": ["errOpen", ["#l1_YQ", "errPerm"]]}"##).unwrap();
        let resp = wire.normalize().unwrap();
        assert_eq!(
            resp.error,
            Some(vec!["errOpen".to_string(), "#l1_YQ".to_string(), "errPerm".to_string()])
        );
        assert!(resp.is_error());
    }

    #[test]
    fn test_normalize_listing_both_shapes() {
        let map = parse_response(br#"{"list": {"l1_YQ": "a.txt"}}"#)
            .unwrap()
            .normalize()
            .unwrap();
        assert_eq!(map.listing.get("a.txt"), Some(&Some(id("l1_YQ"))));

        let names = parse_response(br#"{"list": ["a.txt", "b.txt"]}"#)
            .unwrap()
            .normalize()
            .unwrap();
        assert_eq!(names.listing.len(), 2);
        assert_eq!(names.listing.get("b.txt"), Some(&None));
    }

    #[test]
    fn test_normalize_merges_tree_into_files() {
        let body = json!({
            "files": [{"hash": "l1_YQ", "phash": "l1_Lw", "name": "a", "mime": "directory"}],
            "tree": [
                {"hash": "l1_YQ", "phash": "l1_Lw", "name": "a", "mime": "directory"},
                {"hash": "l1_Yg", "phash": "l1_Lw", "name": "b", "mime": "directory"}
            ]
        });
        let resp = parse_response(body.to_string().as_bytes())
            .unwrap()
            .normalize()
            .unwrap();
        assert_eq!(resp.files.len(), 2);
    }

    #[test]
    fn test_normalize_chunk_merge_fields() {
        let resp = parse_response(br#"{"added": [], "_chunkmerged": "a.bin.tmp", "_name": "a.bin"}"#)
            .unwrap()
            .normalize()
            .unwrap();
        assert_eq!(resp.merge_token.unwrap().as_str(), "a.bin.tmp");
        assert_eq!(resp.merged_name.as_deref(), Some("a.bin"));
    }

    #[test]
    fn test_invalid_body_is_invalid_response() {
        assert!(matches!(
            parse_response(b"<html>oops</html>"),
            Err(TransportError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_encode_params() {
        let params = encode_params(&Command::Paste {
            dst: id("l1_Yg"),
            targets: vec![id("l1_YQ"), id("l1_Yw")],
            cut: true,
            renames: vec!["a".into()],
            suffix: Some("~".into()),
        });
        let expected: Vec<(String, String)> = [
            ("cmd", "paste"),
            ("dst", "l1_Yg"),
            ("targets[]", "l1_YQ"),
            ("targets[]", "l1_Yw"),
            ("cut", "1"),
            ("renames[]", "a"),
            ("suffix", "~"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(params, expected);

        let open = encode_params(&Command::Open {
            target: None,
            init: true,
            tree: false,
            compare: Some(CompareToken::new(3, None)),
        });
        assert!(open.contains(&("init".to_string(), "1".to_string())));
        assert!(open.contains(&("target".to_string(), String::new())));
        assert!(!open.iter().any(|(k, _)| k == "tree"));
        assert!(open.iter().any(|(k, _)| k == "compare"));
    }
}
