//! Resource identity resolution.
//!
//! Many URL shapes point at the same stored object: path-style and
//! virtual-host object URLs, the JSON storage API, and the company storage
//! API that addresses files by `companyId` + `file`/`folder`. All of them are
//! reduced to one canonical identity string before hashing, so every shape
//! lands on the same [`CacheKey`].
//!
//! ```text
//! https://storage.googleapis.com/risemedialibrary-abc/img/a%20b.png ─┐
//! https://www.googleapis.com/storage/v1/b/risemedialibrary-abc/o/... ─┼─> gs://risemedialibrary-abc/img/a b.png
//! https://.../storage/v0.01/getFile?companyId=abc&file=img/a b.png ──┘
//! ```

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;
use url::Url;

/// Key width in bytes (128-bit digest).
pub const KEY_LEN: usize = 16;

/// Bucket naming convention for company media libraries.
pub const COMPANY_BUCKET_PREFIX: &str = "risemedialibrary-";

const PATH_STYLE_HOSTS: &[&str] = &[
    "storage.googleapis.com",
    "storage.cloud.google.com",
    "commondatastorage.googleapis.com",
];

const VIRTUAL_HOST_SUFFIX: &str = ".storage.googleapis.com";

const JSON_API_HOSTS: &[&str] = &["www.googleapis.com", "storage.googleapis.com"];

/// Query parameters that never change the resource being addressed.
const VOLATILE_PARAMS: &[&str] = &["callback", "_", "cb", "cachebuster", "nocache", "timestamp"];

/// Content-derived identifier of a cached resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; KEY_LEN]);

impl CacheKey {
    /// The "no identity" key. Never produced for a real resource.
    pub const NONE: CacheKey = CacheKey([0u8; KEY_LEN]);

    /// Hash a canonical identity string.
    pub fn from_identity(identity: &str) -> Self {
        let digest = blake3::hash(identity.as_bytes());
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..KEY_LEN]);
        if bytes == Self::NONE.0 {
            bytes[KEY_LEN - 1] = 1;
        }
        CacheKey(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(CacheKey(bytes))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != KEY_LEN * 2 {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(&bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("missing resource url")]
    Empty,

    #[error("unparseable url {url}: {reason}")]
    Unparseable { url: String, reason: String },
}

/// An object (or folder) inside a storage bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageObject {
    pub bucket: String,
    /// Bucket-relative path, percent-decoded. Folders end with `/`.
    pub path: String,
}

impl StorageObject {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// Object in a company's media library bucket.
    pub fn for_company(company_id: &str, path: impl Into<String>) -> Self {
        Self::new(format!("{}{}", COMPANY_BUCKET_PREFIX, company_id), path)
    }

    /// Folder in a company's media library bucket.
    pub fn folder_for_company(company_id: &str, folder: &str) -> Self {
        Self::for_company(company_id, as_folder(folder))
    }

    pub fn is_folder(&self) -> bool {
        self.path.is_empty() || self.path.ends_with('/')
    }

    /// Company id encoded in the bucket name, if it follows the convention.
    pub fn company_id(&self) -> Option<&str> {
        self.bucket
            .strip_prefix(COMPANY_BUCKET_PREFIX)
            .filter(|id| !id.is_empty())
    }

    /// The folder that lists this object.
    pub fn parent_folder(&self) -> Option<StorageObject> {
        if self.path.is_empty() {
            return None;
        }
        let trimmed = self.path.trim_end_matches('/');
        let parent = match trimmed.rfind('/') {
            Some(idx) => &trimmed[..=idx],
            None => "",
        };
        Some(StorageObject::new(self.bucket.clone(), parent))
    }

    pub fn identity(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.path)
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::from_identity(&self.identity())
    }
}

/// Result of identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIdentity {
    pub key: CacheKey,
    pub canonical: String,
    pub storage: Option<StorageObject>,
}

/// Resolve a URL to its cache key.
///
/// Empty input yields [`CacheKey::NONE`]. Unparseable input still yields a
/// stable key derived from the trimmed raw string; callers that need to
/// reject such input use [`identify`].
pub fn resolve(url: &str) -> CacheKey {
    match identify(url) {
        Ok(identity) => identity.key,
        Err(IdentityError::Empty) => CacheKey::NONE,
        Err(IdentityError::Unparseable { .. }) => {
            CacheKey::from_identity(&format!("raw:{}", url.trim()))
        }
    }
}

/// Canonicalize a URL into its identity and key.
pub fn identify(url: &str) -> Result<ResourceIdentity, IdentityError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::Empty);
    }

    let parsed = Url::parse(trimmed).map_err(|e| IdentityError::Unparseable {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;

    if let Some(object) = storage_object(&parsed) {
        let canonical = object.identity();
        return Ok(ResourceIdentity {
            key: CacheKey::from_identity(&canonical),
            canonical,
            storage: Some(object),
        });
    }

    let canonical = generic_identity(&parsed);
    Ok(ResourceIdentity {
        key: CacheKey::from_identity(&canonical),
        canonical,
        storage: None,
    })
}

fn decode(segment: &str) -> Cow<'_, str> {
    urlencoding::decode(segment).unwrap_or(Cow::Borrowed(segment))
}

fn as_folder(folder: &str) -> String {
    let folder = folder.trim_start_matches('/');
    if folder.is_empty() || folder.ends_with('/') {
        folder.to_string()
    } else {
        format!("{}/", folder)
    }
}

fn storage_object(url: &Url) -> Option<StorageObject> {
    if let Some(object) = company_api_object(url) {
        return Some(object);
    }

    let host = url.host_str()?.to_ascii_lowercase();
    let segments: Vec<String> = url
        .path_segments()?
        .map(|s| decode(s).into_owned())
        .collect();

    if JSON_API_HOSTS.contains(&host.as_str()) {
        if let Some(object) = json_api_object(&segments) {
            return Some(object);
        }
    }

    if PATH_STYLE_HOSTS.contains(&host.as_str()) {
        let (bucket, rest) = segments.split_first()?;
        if bucket.is_empty() || rest.is_empty() {
            return None;
        }
        return Some(StorageObject::new(bucket.clone(), rest.join("/")));
    }

    if let Some(bucket) = host.strip_suffix(VIRTUAL_HOST_SUFFIX) {
        if bucket.is_empty() || segments.iter().all(|s| s.is_empty()) {
            return None;
        }
        return Some(StorageObject::new(bucket, segments.join("/")));
    }

    None
}

/// `.../storage/v1/b/<bucket>/o/<object>` (optionally under `/download`).
fn json_api_object(segments: &[String]) -> Option<StorageObject> {
    let start = match segments {
        [a, b, ..] if a == "storage" && b == "v1" => 2,
        [d, a, b, ..] if d == "download" && a == "storage" && b == "v1" => 3,
        _ => return None,
    };
    match &segments[start..] {
        [b, bucket, o, object @ ..] if b == "b" && o == "o" && !object.is_empty() => {
            Some(StorageObject::new(bucket.clone(), object.join("/")))
        }
        _ => None,
    }
}

/// `?companyId=<id>&file=<path>` or `?companyId=<id>&folder=<path>`.
fn company_api_object(url: &Url) -> Option<StorageObject> {
    let mut company = None;
    let mut file = None;
    let mut folder = None;
    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "companyId" => company = Some(v.into_owned()),
            "file" => file = Some(v.into_owned()),
            "folder" => folder = Some(v.into_owned()),
            _ => {}
        }
    }
    let company = company.filter(|c| !c.is_empty())?;
    if let Some(file) = file.filter(|f| !f.is_empty()) {
        return Some(StorageObject::for_company(
            &company,
            file.trim_start_matches('/'),
        ));
    }
    folder.map(|folder| StorageObject::folder_for_company(&company, &folder))
}

fn generic_identity(url: &Url) -> String {
    if url.cannot_be_a_base() {
        return url.as_str().to_string();
    }

    let host = url.host_str().unwrap_or("").to_ascii_lowercase();
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = decode(url.path());

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !VOLATILE_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();

    let mut identity = format!("url://{}{}{}", host, port, path);
    if !params.is_empty() {
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        identity.push('?');
        identity.push_str(&query.join("&"));
    }
    identity
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIRECT: &str = "https://storage.googleapis.com/risemedialibrary-abc/img/a%20b.png";

    #[test]
    fn test_escaped_and_unescaped_collide() {
        let unescaped = "https://storage.googleapis.com/risemedialibrary-abc/img/a b.png";
        assert_eq!(resolve(DIRECT), resolve(unescaped));
    }

    #[test]
    fn test_host_aliases_collide() {
        let alias = "https://storage.cloud.google.com/risemedialibrary-abc/img/a%20b.png";
        let legacy = "http://commondatastorage.googleapis.com/risemedialibrary-abc/img/a%20b.png";
        let vhost = "https://risemedialibrary-abc.storage.googleapis.com/img/a%20b.png";
        assert_eq!(resolve(DIRECT), resolve(alias));
        assert_eq!(resolve(DIRECT), resolve(legacy));
        assert_eq!(resolve(DIRECT), resolve(vhost));
    }

    #[test]
    fn test_json_api_collides_with_direct() {
        let json = "https://www.googleapis.com/storage/v1/b/risemedialibrary-abc/o/img%2Fa%20b.png?alt=media";
        let download = "https://storage.googleapis.com/download/storage/v1/b/risemedialibrary-abc/o/img%2Fa%20b.png?alt=media&generation=1";
        assert_eq!(resolve(DIRECT), resolve(json));
        assert_eq!(resolve(DIRECT), resolve(download));
    }

    #[test]
    fn test_company_api_collides_with_direct() {
        let api = "https://storage-dot-rvaserver2.appspot.com/_ah/api/storage/v0.01/getFile?companyId=abc&file=img/a%20b.png";
        let id = identify(api).unwrap();
        assert_eq!(id.key, resolve(DIRECT));
        let object = id.storage.unwrap();
        assert_eq!(object.company_id(), Some("abc"));
        assert_eq!(object.path, "img/a b.png");
    }

    #[test]
    fn test_folder_identity() {
        let api = "https://storage-dot-rvaserver2.appspot.com/_ah/api/storage/v0.01/files?companyId=abc&folder=img";
        let direct = "https://storage.googleapis.com/risemedialibrary-abc/img/";
        let id = identify(api).unwrap();
        assert!(id.storage.as_ref().unwrap().is_folder());
        assert_eq!(id.key, resolve(direct));
        // A folder is a different resource from a file of the same name
        assert_ne!(
            id.key,
            resolve("https://storage.googleapis.com/risemedialibrary-abc/img")
        );
    }

    #[test]
    fn test_different_objects_differ() {
        let a = resolve("https://storage.googleapis.com/bucket/a.png");
        let b = resolve("https://storage.googleapis.com/bucket/b.png");
        let other_bucket = resolve("https://storage.googleapis.com/other/a.png");
        assert_ne!(a, b);
        assert_ne!(a, other_bucket);
    }

    #[test]
    fn test_volatile_params_ignored() {
        let a = "https://contentfinancial2.appspot.com/data?id=AAPL.O&fields=last&callback=jsonp123&_=1700000000";
        let b = "https://contentfinancial2.appspot.com/data?fields=last&id=AAPL.O";
        let c = "https://contentfinancial2.appspot.com/data?id=MSFT.O&fields=last";
        assert_eq!(resolve(a), resolve(b));
        assert_ne!(resolve(a), resolve(c));
    }

    #[test]
    fn test_empty_is_none() {
        assert!(resolve("").is_none());
        assert!(resolve("   ").is_none());
        assert_eq!(identify(""), Err(IdentityError::Empty));
        assert!(!resolve(DIRECT).is_none());
    }

    #[test]
    fn test_unparseable_is_rejected_but_stable() {
        assert!(matches!(
            identify("not a url"),
            Err(IdentityError::Unparseable { .. })
        ));
        assert_eq!(resolve("not a url"), resolve("not a url"));
        assert!(!resolve("not a url").is_none());
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = resolve(DIRECT);
        let hex = key.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(CacheKey::from_hex(&hex), Some(key));
        assert_eq!(CacheKey::from_hex("zz"), None);
    }

    #[test]
    fn test_parent_folder() {
        let object = StorageObject::new("b", "img/sub/a.png");
        assert_eq!(object.parent_folder().unwrap().path, "img/sub/");
        let folder = StorageObject::new("b", "img/sub/");
        assert_eq!(folder.parent_folder().unwrap().path, "img/");
        let top = StorageObject::new("b", "a.png");
        assert_eq!(top.parent_folder().unwrap().path, "");
        assert!(StorageObject::new("b", "").parent_folder().is_none());
    }
}
